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

//! Owned state of the whole attached rig

use crate::config::{Config, Settings};
use crate::stats::{DeviceSnapshot, Statistics};
use crate::topology::Topology;
use crate::window::WorkWindow;

use std::time::Instant;

/// Everything the engine mutates during one session. Created at attach time and dropped at
/// shutdown together with the in-flight work.
#[derive(Debug)]
pub struct Device {
    pub config: Config,
    /// Settings last sent to the boards, `None` until the first calibration
    pub applied: Option<Settings>,
    pub topology: Topology,
    pub stats: Statistics,
    pub window: WorkWindow,
    pub started: Instant,
    pub last_job: Option<Instant>,
}

impl Device {
    pub fn new(config: Config) -> Self {
        let stats = Statistics::new(&config);
        let window = WorkWindow::new(config.work_window);
        Self {
            config,
            applied: None,
            topology: Topology::new(),
            stats,
            window,
            started: Instant::now(),
            last_job: None,
        }
    }

    /// Settings requested by the operator
    #[inline]
    pub fn settings(&self) -> Settings {
        self.config.settings()
    }

    pub fn snapshot(&self, now: Instant) -> DeviceSnapshot {
        let settings = self.settings();
        let stats = &self.stats;
        DeviceSnapshot {
            settings,
            applied: self.applied,
            uptime_secs: now
                .checked_duration_since(self.started)
                .unwrap_or_default()
                .as_secs_f64(),
            last_job_secs: self.last_job.map(|last_job| {
                now.checked_duration_since(last_job)
                    .unwrap_or_default()
                    .as_secs_f64()
            }),
            accepted: stats.accepted,
            rejected: stats.rejected,
            nonces: stats.nonces,
            hashes: stats.hashes,
            errors: stats.errors,
            ignored: stats.ignored,
            hwe: stats.hwe(),
            hashrate: stats.hashrate(now),
            expected_hashrate: stats.expected_hashrate(settings.clock),
            efficiency: stats.efficiency(settings.clock, now),
            work_in_flight: self.window.len(),
            boards: stats.board_snapshots(now),
        }
    }
}
