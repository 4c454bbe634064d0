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

use blockerupter::config::{self, Config};
use blockerupter::engine::{Engine, SnapshotCell};
use blockerupter::logging::macros::*;
use blockerupter::shutdown;
use blockerupter::transport::{Bus, SerialTransport};
use blockerupter::work::{NullWork, ResultSink, Work};

use clap::{self, Arg};

use std::process;
use std::thread;
use std::time::Duration;

/// Result sink used for diagnostics, solutions are only logged
struct LogSink;

impl ResultSink for LogSink {
    fn submit(&mut self, work: &Work, nonce: u32) {
        info!(
            "Nonce {:08x} for midstate {}",
            nonce,
            hex::encode(&work.midstate)
        );
    }
}

/// Log hashrate summary of the latest snapshot periodically
fn hashrate_reporter(cell: SnapshotCell, interval: Duration) {
    loop {
        thread::sleep(interval);
        let snapshot = match cell.get() {
            Some(snapshot) => snapshot,
            None => continue,
        };
        info!(
            "Hashrate {:.2} GH/s ({:.1} %), accepted {}, rejected {}, hw errors {}",
            snapshot.hashrate * 1e-9,
            snapshot.efficiency * 100.0,
            snapshot.accepted,
            snapshot.rejected,
            snapshot.errors
        );
        for board in &snapshot.boards {
            let bad_chips = board.chips.iter().filter(|chip| chip.bad).count();
            debug!(
                "Board {}: {:.2} GH/s, hwe {:.3}, bad chips {}, unresponsive {}",
                board.board,
                board.hashrate * 1e-9,
                board.hwe,
                bad_chips,
                board.unresponsive
            );
        }
        trace!("{}", snapshot.to_json());
    }
}

fn parse_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Option<T> {
    let value = matches.value_of(name)?;
    match value.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("Invalid value '{}' of '{}'", value, name);
            process::exit(2);
        }
    }
}

fn main() {
    let matches = clap::App::new("blockerupter")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device the boards are attached to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("clock")
                .long("clock")
                .value_name("N")
                .help("Clock setting, chips run at (N + 1) * 5 MHz")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("difficulty")
                .long("difficulty")
                .value_name("N")
                .help("Chip difficulty (1, 4, 16 or 64)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("rolling")
                .long("rolling")
                .value_name("N")
                .help("nTime rolling window of (N + 1) * 30 seconds")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        }),
        None => match Config::load_optional(config::DEFAULT_CONFIG_PATH) {
            Ok(Some(config)) => config,
            Ok(None) => {
                info!(
                    "No {} found, using default configuration",
                    config::DEFAULT_CONFIG_PATH
                );
                Config::default()
            }
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
    };
    if let Some(device) = matches.value_of("device") {
        config.device = device.to_string();
    }
    if let Some(clock) = parse_arg(&matches, "clock") {
        config.clock = clock;
    }
    if let Some(difficulty) = parse_arg(&matches, "difficulty") {
        config.difficulty = difficulty;
    }
    if let Some(rolling) = parse_arg(&matches, "rolling") {
        config.rolling = rolling;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    info!(
        "Block Erupter: opening {} at {} baud",
        config.device, config.baud_rate
    );
    let transport = SerialTransport::open(&config.device, config.baud_rate, config.timeout())
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        });

    let (shutdown_sender, mut shutdown_receiver) = shutdown::channel();
    ctrlc::set_handler(move || shutdown_sender.send("interrupted"))
        .expect("BUG: cannot install Ctrl-C handler");

    let interval = config.hashrate_interval();
    let mut engine = Engine::new(config, Bus::new(transport), NullWork::new(), LogSink)
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        });
    let cell = engine.snapshot_cell();
    thread::spawn(move || hashrate_reporter(cell, interval));

    let result = engine.run(&mut shutdown_receiver);
    let snapshot = engine.snapshot();
    info!(
        "Session finished: accepted {}, rejected {}, hw errors {}, ignored {}",
        snapshot.accepted, snapshot.rejected, snapshot.errors, snapshot.ignored
    );
    // let the asynchronous drain flush
    thread::sleep(Duration::from_millis(100));
    if result.is_err() {
        process::exit(1);
    }
}
