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

//! Byte transport to the boards
//!
//! All boards share one half-duplex serial link. `Bus` serializes access to the transport so
//! that exactly one request/response exchange is outstanding at any moment.

use crate::error::{self, ErrorKind};

use failure::ResultExt;

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Narrow interface to an opened byte link with a fixed read timeout
pub trait Transport: Send {
    /// Read up to `len` bytes. Returns whatever arrived before the timeout expired, an empty
    /// vector means that nothing arrived at all.
    fn read_bytes(&mut self, len: usize) -> error::Result<Vec<u8>>;

    /// Write all bytes or fail with `ErrorKind::Transport`
    fn write_bytes(&mut self, data: &[u8]) -> error::Result<()>;

    /// Drop any stale input waiting in the receive buffer
    fn flush_input(&mut self) -> error::Result<()> {
        Ok(())
    }
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> error::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .with_context(|e| ErrorKind::Io(format!("cannot open '{}': {}", path, e)))?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read_bytes(&mut self, len: usize) -> error::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e).with_context(|e| {
                    ErrorKind::Transport(format!("read failed ({}/{}): {}", filled, len, e))
                })?,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write_bytes(&mut self, data: &[u8]) -> error::Result<()> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .with_context(|e| {
                ErrorKind::Transport(format!("write of {} bytes failed: {}", data.len(), e))
            })?;
        Ok(())
    }

    fn flush_input(&mut self) -> error::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .with_context(|e| ErrorKind::Transport(format!("cannot clear input: {}", e)))?;
        Ok(())
    }
}

/// Shared single-owner access to the transport
pub struct Bus<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    /// Run one request/response exchange with exclusive access to the link. Stale input is
    /// flushed before the exchange starts.
    pub fn transaction<F, R>(&self, exchange: F) -> error::Result<R>
    where
        F: FnOnce(&mut T) -> error::Result<R>,
    {
        let mut transport = self
            .inner
            .lock()
            .map_err(|_| ErrorKind::Transport("bus lock poisoned".to_string()))?;
        transport.flush_input()?;
        exchange(&mut *transport)
    }

    /// Send bytes that are not answered
    pub fn send(&self, data: &[u8]) -> error::Result<()> {
        self.transaction(|transport| transport.write_bytes(data))
    }

    /// Send request and read response of fixed length (possibly short on timeout)
    pub fn request(&self, data: &[u8], response_len: usize) -> error::Result<Vec<u8>> {
        self.transaction(|transport| {
            transport.write_bytes(data)?;
            transport.read_bytes(response_len)
        })
    }
}
