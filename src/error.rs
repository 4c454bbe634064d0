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

//! Block Erupter errors
//!
//! Byte and frame level errors (`Transport`, `ShortFrame`, `UnrecognizedStatus`) are expected
//! from real hardware and are absorbed by the engine within one polling cycle. The rest of the
//! kinds are fatal for the session, see `Error::is_fatal`.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// Short or failed transfer on the serial link.
    #[fail(display = "Transport: {}", _0)]
    Transport(String),

    /// Frame received from a board is shorter than its layout.
    #[fail(display = "Short frame: expected {} bytes, got {}", expected, actual)]
    ShortFrame { expected: usize, actual: usize },

    /// Status byte doesn't match any reserved value.
    #[fail(display = "Unrecognized status byte: {:#04x}", _0)]
    UnrecognizedStatus(u8),

    /// Board slot that has never been scanned or didn't respond to the scan.
    #[fail(display = "Unknown board: {}", _0)]
    UnknownBoard(usize),

    /// Outbound payload that doesn't fit the wire layout.
    #[fail(display = "Encoding: {}", _0)]
    Encoding(String),

    /// Invalid configuration value.
    #[fail(display = "Config: {}", _0)]
    Config(String),

    /// Scan didn't find any board on the bus.
    #[fail(display = "No boards detected")]
    NoBoards,
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }

    /// Errors that end the mining session. Everything else is a glitch of the hardware or
    /// the link and is accounted in statistics instead.
    pub fn is_fatal(&self) -> bool {
        match self.inner.get_context() {
            ErrorKind::Transport(_)
            | ErrorKind::ShortFrame { .. }
            | ErrorKind::UnrecognizedStatus(_) => false,
            _ => true,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(serial_error: serialport::Error) -> Self {
        let msg = serial_error.to_string();
        Self {
            inner: serial_error.context(ErrorKind::Io(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
