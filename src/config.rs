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

//! This module handles Block Erupter configuration and configuration file parsing

use crate::error::{self, ErrorKind};

use failure::ResultExt;
use serde::{Deserialize, Serialize};

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Number of addressable board slots on the bus (5 bits of board id)
pub const MAX_BOARDS: usize = 32;

/// Number of chips on one board
pub const MAX_ASICS: usize = 48;

/// Serial link speed
pub const DEFAULT_BAUD_RATE: u32 = 460_800;

/// Read timeout of one transfer on the serial link
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

pub const DEFAULT_DEVICE: &'static str = "/dev/ttyUSB0";

/// Highest clock setting accepted by the boards
pub const CLOCK_MAX: u8 = 29;
pub const DEFAULT_CLOCK: u8 = 23;

/// Default chip difficulty (nonces are reported only at this difficulty or above)
pub const DEFAULT_DIFFICULTY: u32 = 64;

/// Supported chip difficulties, the index is the value of difficulty bits
pub const DIFFICULTIES: [u32; 4] = [1, 4, 16, 64];

/// Highest rolling setting (5 bits of the command argument)
pub const ROLLING_MAX: u8 = 31;
pub const DEFAULT_ROLLING: u8 = 5;

/// Number of jobs that can be in flight at once
pub const DEFAULT_WORK_WINDOW: usize = 128;

/// Job index is one byte, so the window cannot be larger than this
pub const WORK_WINDOW_MAX: usize = 256;

/// Default hashrate interval used for statistics in seconds
pub const DEFAULT_HASHRATE_INTERVAL: Duration = Duration::from_secs(60);

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/blockerupter.toml";

/// Operator tunable chip settings which the engine keeps applied on the boards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Clock setting, chips run at `(clock + 1) * 5` MHz
    pub clock: u8,
    /// Chip difficulty, one of `DIFFICULTIES`
    pub difficulty: u32,
    /// Rolling setting, boards may roll nTime for `(rolling + 1) * 30` seconds
    pub rolling: u8,
}

impl Settings {
    pub fn validate(&self) -> error::Result<()> {
        if self.clock > CLOCK_MAX {
            Err(ErrorKind::Config(format!(
                "clock {} is out of range 0..={}",
                self.clock, CLOCK_MAX
            )))?
        }
        if self.rolling > ROLLING_MAX {
            Err(ErrorKind::Config(format!(
                "rolling {} is out of range 0..={}",
                self.rolling, ROLLING_MAX
            )))?
        }
        difficulty_bits(self.difficulty)?;
        Ok(())
    }

    /// Chip clock frequency in MHz
    #[inline]
    pub fn clock_mhz(&self) -> u32 {
        clock_mhz(self.clock)
    }

    /// Length of the nTime rolling window
    #[inline]
    pub fn rolling_window(&self) -> Duration {
        rolling_window(self.rolling)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clock: DEFAULT_CLOCK,
            difficulty: DEFAULT_DIFFICULTY,
            rolling: DEFAULT_ROLLING,
        }
    }
}

pub fn clock_mhz(clock: u8) -> u32 {
    (clock as u32 + 1) * 5
}

pub fn rolling_window(rolling: u8) -> Duration {
    Duration::from_secs((rolling as u64 + 1) * 30)
}

/// Convert chip difficulty to the 2 bits carried by the `SetDifficulty` command
pub fn difficulty_bits(difficulty: u32) -> error::Result<u8> {
    DIFFICULTIES
        .iter()
        .position(|&d| d == difficulty)
        .map(|bits| bits as u8)
        .ok_or_else(|| {
            ErrorKind::Config(format!(
                "difficulty {} is not one of {:?}",
                difficulty, DIFFICULTIES
            ))
            .into()
        })
}

/// Chip difficulty encoded by the difficulty bits
pub fn difficulty_from_bits(bits: u8) -> u32 {
    DIFFICULTIES[(bits & 0x03) as usize]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the serial device
    pub device: String,
    pub baud_rate: u32,
    /// Read timeout of one transfer in milliseconds
    pub timeout_ms: u64,
    pub clock: u8,
    pub difficulty: u32,
    pub rolling: u8,
    /// Capacity of the work window
    pub work_window: usize,
    /// Work item is retired after this many accepted nonces
    pub max_nonces_per_job: usize,
    /// Number of attempts to get a job acknowledged by a board
    pub submit_retries: usize,
    /// Number of polling cycles between calibrations
    pub calibration_interval: u64,
    /// Pause between polling cycles in milliseconds
    pub poll_delay_ms: u64,
    pub reset_on_start: bool,
    pub reset_settle_ms: u64,
    pub hashrate_interval_secs: u64,
    /// Chip hardware error rate above which the chip is declared bad
    pub bad_chip_threshold: f64,
    /// Minimal number of samples (accepted + errors) before a chip can be declared bad
    pub bad_chip_min_samples: u64,
    /// Consecutive poll timeouts after which a board is flagged unresponsive
    pub unresponsive_timeouts: u64,
    /// Maximal age of in-flight work, defaults to the rolling window length
    pub job_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            clock: DEFAULT_CLOCK,
            difficulty: DEFAULT_DIFFICULTY,
            rolling: DEFAULT_ROLLING,
            work_window: DEFAULT_WORK_WINDOW,
            max_nonces_per_job: 1,
            submit_retries: 3,
            calibration_interval: 100,
            poll_delay_ms: 10,
            reset_on_start: true,
            reset_settle_ms: 500,
            hashrate_interval_secs: DEFAULT_HASHRATE_INTERVAL.as_secs(),
            bad_chip_threshold: 0.25,
            bad_chip_min_samples: 20,
            unresponsive_timeouts: 10,
            job_timeout_secs: None,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text and validate it
    pub fn parse(text: &str) -> error::Result<Self> {
        let config: Self = toml::from_str(text)
            .with_context(|e| ErrorKind::Config(format!("cannot parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|e| {
            ErrorKind::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Load configuration file that may not exist. A missing file gives `None`, any other
    /// failure is an error.
    pub fn load_optional<P: AsRef<Path>>(path: P) -> error::Result<Option<Self>> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ErrorKind::Config(format!(
                "cannot read '{}': {}",
                path.display(),
                e
            ))
            .into()),
        }
    }

    pub fn validate(&self) -> error::Result<()> {
        self.settings().validate()?;
        if self.baud_rate == 0 {
            Err(ErrorKind::Config("baud rate cannot be zero".to_string()))?
        }
        if self.timeout_ms == 0 {
            Err(ErrorKind::Config("timeout cannot be zero".to_string()))?
        }
        if self.work_window == 0 || self.work_window > WORK_WINDOW_MAX {
            Err(ErrorKind::Config(format!(
                "work window {} is out of range 1..={}",
                self.work_window, WORK_WINDOW_MAX
            )))?
        }
        if self.max_nonces_per_job == 0 {
            Err(ErrorKind::Config(
                "max nonces per job cannot be zero".to_string(),
            ))?
        }
        if self.submit_retries == 0 {
            Err(ErrorKind::Config("submit retries cannot be zero".to_string()))?
        }
        if self.calibration_interval == 0 {
            Err(ErrorKind::Config(
                "calibration interval cannot be zero".to_string(),
            ))?
        }
        if self.hashrate_interval_secs == 0 {
            Err(ErrorKind::Config(
                "hashrate interval cannot be zero".to_string(),
            ))?
        }
        if !(self.bad_chip_threshold > 0.0 && self.bad_chip_threshold <= 1.0) {
            Err(ErrorKind::Config(format!(
                "bad chip threshold {} is out of range (0, 1]",
                self.bad_chip_threshold
            )))?
        }
        if self.unresponsive_timeouts == 0 {
            Err(ErrorKind::Config(
                "unresponsive timeouts cannot be zero".to_string(),
            ))?
        }
        if self.job_timeout_secs == Some(0) {
            Err(ErrorKind::Config("job timeout cannot be zero".to_string()))?
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            clock: self.clock,
            difficulty: self.difficulty,
            rolling: self.rolling,
        }
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.clock = settings.clock;
        self.difficulty = settings.difficulty;
        self.rolling = settings.rolling;
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[inline]
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    #[inline]
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    #[inline]
    pub fn hashrate_interval(&self) -> Duration {
        Duration::from_secs(self.hashrate_interval_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        match self.job_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => rolling_window(self.rolling),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        config.validate().expect("default config is valid");
        assert_eq!(config.clock, 23);
        assert_eq!(config.difficulty, 64);
        assert_eq!(config.rolling, 5);
        assert_eq!(config.baud_rate, 460_800);
        assert_eq!(config.settings().clock_mhz(), 120);
        assert_eq!(config.job_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn test_parse_partial() {
        let config = Config::parse(
            r#"
            device = "/dev/ttyACM1"
            clock = 29
            difficulty = 16
            job_timeout_secs = 60
            "#,
        )
        .expect("valid config");
        assert_eq!(config.device, "/dev/ttyACM1");
        assert_eq!(config.clock, 29);
        assert_eq!(config.difficulty, 16);
        assert_eq!(config.rolling, DEFAULT_ROLLING);
        assert_eq!(config.job_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::parse("clock = 30").is_err());
        match Config::parse("difficulty = 32").map_err(|e| e.kind()) {
            Err(ErrorKind::Config(_)) => (),
            r => panic!("unexpected result {:?}", r),
        }
        assert!(Config::parse("work_window = 0").is_err());
        assert!(Config::parse("work_window = 257").is_err());
        assert!(Config::parse("bad_chip_threshold = 1.5").is_err());
        assert!(Config::parse("clock = \"fast\"").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().expect("cannot create temp file");
        writeln!(file, "rolling = 1\nwork_window = 16").expect("cannot write config");

        let config = Config::load(file.path()).expect("valid config file");
        assert_eq!(config.rolling, 1);
        assert_eq!(config.work_window, 16);
        assert_eq!(config.job_timeout(), Duration::from_secs(60));

        assert!(Config::load("/nonexistent/blockerupter.toml").is_err());
    }

    #[test]
    fn test_load_optional_file() {
        let dir = tempfile::tempdir().expect("cannot create temp dir");
        let path = dir.path().join("blockerupter.toml");
        assert!(Config::load_optional(&path)
            .expect("missing file is fine")
            .is_none());

        fs::write(&path, "clock = 20\n").expect("cannot write config");
        let config = Config::load_optional(&path)
            .expect("valid config file")
            .expect("existing file");
        assert_eq!(config.clock, 20);

        fs::write(&path, "clock = \"fast\"\n").expect("cannot write config");
        match Config::load_optional(&path).map_err(|e| e.kind()) {
            Err(ErrorKind::Config(_)) => (),
            r => panic!("unexpected result {:?}", r),
        }

        // settings out of range are rejected as well
        fs::write(&path, "clock = 30\n").expect("cannot write config");
        assert!(Config::load_optional(&path).is_err());
    }

    #[test]
    fn test_difficulty_bits() {
        assert_eq!(difficulty_bits(1).expect("valid"), 0);
        assert_eq!(difficulty_bits(4).expect("valid"), 1);
        assert_eq!(difficulty_bits(16).expect("valid"), 2);
        assert_eq!(difficulty_bits(64).expect("valid"), 3);
        assert!(difficulty_bits(2).is_err());
        assert_eq!(difficulty_from_bits(3), 64);
    }
}
