// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Shutdown signalling between the controlling thread and the engine loop
//!
//! The engine checks for a shutdown request between polling cycles only, so a request never
//! interrupts a frame in the middle of transfer.

use futures::channel::mpsc;

/// Message used for shutdown synchronization
pub type ShutdownMsg = &'static str;

/// Sender side of shutdown messenger
#[derive(Clone)]
pub struct Sender(mpsc::UnboundedSender<ShutdownMsg>);

impl Sender {
    /// Request shutdown, requests after the engine has stopped are dropped
    pub fn send(&self, msg: ShutdownMsg) {
        let _ = self.0.unbounded_send(msg);
    }
}

/// Receiver side of shutdown messenger
pub struct Receiver(mpsc::UnboundedReceiver<ShutdownMsg>);

impl Receiver {
    /// Check for shutdown request without blocking
    pub fn try_receive(&mut self) -> Option<ShutdownMsg> {
        match self.0.try_next() {
            Ok(Some(msg)) => Some(msg),
            // all senders are gone, nobody can stop us anymore
            Ok(None) => Some("shutdown channel closed"),
            Err(_) => None,
        }
    }
}

/// Shutdown messenger channel
pub fn channel() -> (Sender, Receiver) {
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded();
    (Sender(shutdown_tx), Receiver(shutdown_rx))
}
