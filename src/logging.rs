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

//! Process-wide logger shared by the engine and the binary

use std::env;

use lazy_static::lazy_static;
use slog::{o, Drain, Level, LevelFilter, Logger};

/// Override the default drain channel size as miner tends to burst messages into the logger
pub const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 128;

lazy_static! {
    /// Build static reference to the logger that will be accessible from all modules
    pub static ref LOGGER: Logger = {
        // envlogger doesn't allow to set default log level, so this is a workaround
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "info");
        }

        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = LevelFilter::new(drain, Level::Trace).fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain)
            .chan_size(ASYNC_LOGGER_DRAIN_CHANNEL_SIZE)
            .build()
            .fuse();

        Logger::root(drain, o!())
    };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)+) => {
        ::slog::error!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => {
        ::slog::warn!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)+) => {
        ::slog::info!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => {
        ::slog::debug!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => {
        ::slog::trace!($crate::logging::LOGGER, $($args)+)
    };
}

/// Logging macros bound to the global `LOGGER`
pub mod macros {
    pub use crate::{debug, error, info, trace, warn};
}
