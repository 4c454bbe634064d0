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

//! Counters and derived metrics of the whole rig
//!
//! Statistics are fed with events decoded by the engine. They never fail: events addressing a
//! board that isn't attached or a chip out of range are dropped and counted as ignored.
//!
//! Note: `accepted`, `rejected` and `nonces` are in nonce reports, `hashes` are in hashes
//! equivalent to accepted nonces at the difficulty they were found at.

use crate::config::{self, Config, Settings, MAX_ASICS, MAX_BOARDS};
use crate::mean::SlidingRate;

use serde::Serialize;

use std::time::{Duration, Instant};

/// Number of hashes represented by one nonce found at given chip difficulty
#[inline]
pub fn hashes_per_nonce(difficulty: u32) -> u64 {
    (difficulty as u64) << 32
}

/// Hardware error rate, zero when nothing has been observed yet
fn error_rate(errors: u64, accepted: u64) -> f64 {
    let samples = errors + accepted;
    if samples == 0 {
        0.0
    } else {
        errors as f64 / samples as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chip {
    /// Chip is excluded from the expected hashrate, never cleared during the session
    pub bad: bool,
    pub accepted: u64,
    pub rejected: u64,
    /// All nonce reports attributed to the chip
    pub nonces: u64,
    pub hashes: u64,
    pub errors: u64,
}

impl Chip {
    /// Hardware error rate: `errors / (errors + accepted)`
    pub fn hwe(&self) -> f64 {
        error_rate(self.errors, self.accepted)
    }

    #[inline]
    pub fn samples(&self) -> u64 {
        self.errors + self.accepted
    }
}

#[derive(Debug, Clone)]
pub struct Board {
    pub jobs: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub nonces: u64,
    pub hashes: u64,
    /// Hardware errors including the ones not attributable to a chip
    pub errors: u64,
    pub timeouts: u64,
    pub consecutive_timeouts: u64,
    /// Board stopped answering polls, it is still present
    pub unresponsive: bool,
    /// Malformed or short frames received from the board
    pub glitches: u64,
    rate: SlidingRate,
    pub chips: Vec<Chip>,
}

impl Board {
    fn new(hashrate_interval: Duration) -> Self {
        Self {
            jobs: 0,
            accepted: 0,
            rejected: 0,
            nonces: 0,
            hashes: 0,
            errors: 0,
            timeouts: 0,
            consecutive_timeouts: 0,
            unresponsive: false,
            glitches: 0,
            rate: SlidingRate::new(hashrate_interval),
            chips: vec![Chip::default(); MAX_ASICS],
        }
    }

    pub fn hwe(&self) -> f64 {
        error_rate(self.errors, self.accepted)
    }

    pub fn hashrate(&self, now: Instant) -> f64 {
        self.rate.measure(now)
    }

    pub fn good_chips(&self) -> usize {
        self.chips.iter().filter(|chip| !chip.bad).count()
    }
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub started: Instant,
    /// Chip difficulty nonces are currently found at
    difficulty: u32,
    bad_chip_threshold: f64,
    bad_chip_min_samples: u64,
    unresponsive_timeouts: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub nonces: u64,
    pub hashes: u64,
    pub errors: u64,
    /// Events dropped because they addressed something that doesn't exist
    pub ignored: u64,
    rate: SlidingRate,
    boards: Vec<Option<Board>>,
}

impl Statistics {
    pub fn new(config: &Config) -> Self {
        Self {
            started: Instant::now(),
            difficulty: config.difficulty,
            bad_chip_threshold: config.bad_chip_threshold,
            bad_chip_min_samples: config.bad_chip_min_samples,
            unresponsive_timeouts: config.unresponsive_timeouts,
            accepted: 0,
            rejected: 0,
            nonces: 0,
            hashes: 0,
            errors: 0,
            ignored: 0,
            rate: SlidingRate::new(config.hashrate_interval()),
            boards: vec![None; MAX_BOARDS],
        }
    }

    /// Start collecting statistics for a present board
    pub fn attach_board(&mut self, board_id: usize) {
        let interval = self.rate.interval();
        if let Some(slot) = self.boards.get_mut(board_id) {
            slot.get_or_insert_with(|| Board::new(interval));
        }
    }

    /// Difficulty applied to the chips, used for accounting of the following nonces
    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty;
    }

    pub fn board(&self, board_id: usize) -> Option<&Board> {
        self.boards.get(board_id).and_then(|board| board.as_ref())
    }

    pub fn chip(&self, board_id: usize, chip: usize) -> Option<&Chip> {
        self.board(board_id).and_then(|board| board.chips.get(chip))
    }

    pub fn boards(&self) -> impl Iterator<Item = (usize, &Board)> {
        self.boards
            .iter()
            .enumerate()
            .filter_map(|(board_id, board)| board.as_ref().map(|board| (board_id, board)))
    }

    fn board_mut(&mut self, board_id: usize) -> Option<&mut Board> {
        match self.boards.get_mut(board_id).and_then(|board| board.as_mut()) {
            Some(board) => Some(board),
            None => {
                self.ignored += 1;
                None
            }
        }
    }

    fn chip_mut(&mut self, board_id: usize, chip: usize) -> Option<(&mut Board, usize)> {
        if chip >= MAX_ASICS {
            self.ignored += 1;
            return None;
        }
        self.board_mut(board_id).map(|board| (board, chip))
    }

    /// Account malformed event
    pub fn ignore_event(&mut self) {
        self.ignored += 1;
    }

    pub fn on_job_submitted(&mut self, board_id: usize) {
        if let Some(board) = self.board_mut(board_id) {
            board.jobs += 1;
        }
    }

    pub fn on_nonce_accepted(&mut self, board_id: usize, chip: usize, now: Instant) {
        let hashes = hashes_per_nonce(self.difficulty);
        let (board, chip) = match self.chip_mut(board_id, chip) {
            Some(target) => target,
            None => return,
        };
        board.accepted += 1;
        board.nonces += 1;
        board.hashes += hashes;
        board.rate.insert(hashes as f64, now);
        let chip = &mut board.chips[chip];
        chip.accepted += 1;
        chip.nonces += 1;
        chip.hashes += hashes;

        self.accepted += 1;
        self.nonces += 1;
        self.hashes += hashes;
        self.rate.insert(hashes as f64, now);
    }

    /// Nonce that has already been accounted for its work
    pub fn on_nonce_rejected(&mut self, board_id: usize, chip: usize) {
        let (board, chip) = match self.chip_mut(board_id, chip) {
            Some(target) => target,
            None => return,
        };
        board.rejected += 1;
        board.nonces += 1;
        board.chips[chip].rejected += 1;
        board.chips[chip].nonces += 1;

        self.rejected += 1;
        self.nonces += 1;
    }

    /// Account hardware error of a chip or of the whole board when `chip` is `None`
    pub fn on_hardware_error(&mut self, board_id: usize, chip: Option<usize>) {
        match chip {
            Some(chip) => {
                let (board, chip) = match self.chip_mut(board_id, chip) {
                    Some(target) => target,
                    None => return,
                };
                board.errors += 1;
                board.nonces += 1;
                board.chips[chip].errors += 1;
                board.chips[chip].nonces += 1;
                self.nonces += 1;
            }
            None => match self.board_mut(board_id) {
                Some(board) => board.errors += 1,
                None => return,
            },
        }
        self.errors += 1;
    }

    /// Account poll timeout. Returns `true` when the board has just become unresponsive.
    pub fn on_board_timeout(&mut self, board_id: usize) -> bool {
        let limit = self.unresponsive_timeouts;
        let became_unresponsive = match self.board_mut(board_id) {
            Some(board) => {
                board.timeouts += 1;
                board.consecutive_timeouts += 1;
                let flag = !board.unresponsive && board.consecutive_timeouts >= limit;
                if flag {
                    board.unresponsive = true;
                }
                flag
            }
            None => return false,
        };
        self.on_hardware_error(board_id, None);
        became_unresponsive
    }

    /// Board answered a poll. Returns `true` when an unresponsive board has recovered.
    pub fn on_board_responded(&mut self, board_id: usize) -> bool {
        match self.board_mut(board_id) {
            Some(board) => {
                board.consecutive_timeouts = 0;
                let recovered = board.unresponsive;
                board.unresponsive = false;
                recovered
            }
            None => false,
        }
    }

    /// Account malformed or short frame
    pub fn on_glitch(&mut self, board_id: usize) {
        if let Some(board) = self.board_mut(board_id) {
            board.glitches += 1;
        }
    }

    /// Latch bad flag of the chip. Returns `true` only when the chip wasn't bad before.
    pub fn mark_bad(&mut self, board_id: usize, chip: usize) -> bool {
        match self.chip_mut(board_id, chip) {
            Some((board, chip)) if !board.chips[chip].bad => {
                board.chips[chip].bad = true;
                true
            }
            _ => false,
        }
    }

    /// Mark chip bad once its hardware error rate exceeds the threshold over enough samples.
    /// Returns `true` exactly once per chip, when the flag is set.
    pub fn mark_bad_if_needed(&mut self, board_id: usize, chip: usize) -> bool {
        let exceeded = match self.chip(board_id, chip) {
            Some(stats) => {
                !stats.bad
                    && stats.samples() >= self.bad_chip_min_samples
                    && stats.hwe() > self.bad_chip_threshold
            }
            None => false,
        };
        exceeded && self.mark_bad(board_id, chip)
    }

    pub fn is_bad(&self, board_id: usize, chip: usize) -> bool {
        self.chip(board_id, chip).map_or(false, |chip| chip.bad)
    }

    /// Device hashrate in hashes per second
    pub fn hashrate(&self, now: Instant) -> f64 {
        self.rate.measure(now)
    }

    /// Hashrate of good chips of all attached boards at given clock setting. Boards that have
    /// stopped answering contribute nothing until they respond again.
    pub fn expected_hashrate(&self, clock: u8) -> f64 {
        let good_chips: usize = self
            .boards()
            .filter(|(_, board)| !board.unresponsive)
            .map(|(_, board)| board.good_chips())
            .sum();
        good_chips as f64 * config::clock_mhz(clock) as f64 * 1e6
    }

    /// Ratio of actual and expected hashrate
    pub fn efficiency(&self, clock: u8, now: Instant) -> f64 {
        let expected = self.expected_hashrate(clock);
        if expected > 0.0 {
            self.hashrate(now) / expected
        } else {
            0.0
        }
    }

    pub fn hwe(&self) -> f64 {
        error_rate(self.errors, self.accepted)
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.started).unwrap_or_default()
    }

    pub fn board_snapshots(&self, now: Instant) -> Vec<BoardSnapshot> {
        let uptime = self.uptime(now).as_secs_f64();
        self.boards()
            .map(|(board_id, board)| BoardSnapshot {
                board: board_id,
                jobs: board.jobs,
                accepted: board.accepted,
                rejected: board.rejected,
                nonces: board.nonces,
                hashes: board.hashes,
                errors: board.errors,
                hwe: board.hwe(),
                timeouts: board.timeouts,
                unresponsive: board.unresponsive,
                glitches: board.glitches,
                hashrate: board.hashrate(now),
                chips: board
                    .chips
                    .iter()
                    .enumerate()
                    .map(|(chip_id, chip)| ChipSnapshot {
                        chip: chip_id,
                        bad: chip.bad,
                        accepted: chip.accepted,
                        rejected: chip.rejected,
                        nonces: chip.nonces,
                        hashes: chip.hashes,
                        errors: chip.errors,
                        hwe: chip.hwe(),
                        hashrate: if uptime > 0.0 {
                            chip.hashes as f64 / uptime
                        } else {
                            0.0
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChipSnapshot {
    pub chip: usize,
    pub bad: bool,
    pub accepted: u64,
    pub rejected: u64,
    pub nonces: u64,
    pub hashes: u64,
    pub errors: u64,
    pub hwe: f64,
    /// Session average
    pub hashrate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub board: usize,
    pub jobs: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub nonces: u64,
    pub hashes: u64,
    pub errors: u64,
    pub hwe: f64,
    pub timeouts: u64,
    pub unresponsive: bool,
    pub glitches: u64,
    pub hashrate: f64,
    pub chips: Vec<ChipSnapshot>,
}

/// Read-only copy of the device state for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Settings requested by the operator
    pub settings: Settings,
    /// Settings last sent to the boards
    pub applied: Option<Settings>,
    pub uptime_secs: f64,
    /// Time since the last job was submitted
    pub last_job_secs: Option<f64>,
    pub accepted: u64,
    pub rejected: u64,
    pub nonces: u64,
    pub hashes: u64,
    pub errors: u64,
    pub ignored: u64,
    pub hwe: f64,
    pub hashrate: f64,
    pub expected_hashrate: f64,
    pub efficiency: f64,
    pub work_in_flight: usize,
    pub boards: Vec<BoardSnapshot>,
}

impl DeviceSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
