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

//! Work coming from the pool side and the seams the engine uses to exchange it

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Work as handed over by the work source: everything a board needs to search for a nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    /// Internal state of SHA256 after processing the first chunk of block header
    pub midstate: Vec<u8>,
    /// Remaining 12 bytes of block header (merkle root tail, time and bits)
    pub header_tail: Vec<u8>,
    pub extranonce2: Vec<u8>,
}

/// Provider of new work, usually backed by a pool client
pub trait WorkSource {
    /// Return next work or `None` when there's nothing to mine right now
    fn next_work(&mut self) -> Option<Work>;
}

/// Consumer of solutions found by the boards
pub trait ResultSink {
    fn submit(&mut self, work: &Work, nonce: u32);
}

/// Work generator producing unique dummy work for diagnostics and tests
#[derive(Debug, Default)]
pub struct NullWork {
    counter: u32,
}

impl NullWork {
    pub fn new() -> Self {
        Default::default()
    }

    /// * `i` - unique identifier for the generated work
    pub fn prepare(i: u32) -> Work {
        let mut midstate = vec![0u8; 32];
        midstate[..4].copy_from_slice(&i.to_le_bytes());

        // zero merkle tail and time, easiest difficulty bits
        let mut header_tail = vec![0u8; 12];
        header_tail[8..].copy_from_slice(&0xffff_ffffu32.to_le_bytes());

        Work {
            midstate,
            header_tail,
            extranonce2: i.to_le_bytes().to_vec(),
        }
    }
}

impl WorkSource for NullWork {
    fn next_work(&mut self) -> Option<Work> {
        let work = Self::prepare(self.counter);
        self.counter = self.counter.wrapping_add(1);
        Some(work)
    }
}

/// Finite queue of work, exhausted once drained
impl WorkSource for VecDeque<Work> {
    fn next_work(&mut self) -> Option<Work> {
        self.pop_front()
    }
}

/// Result sink collecting solutions so they can be inspected from another thread
#[derive(Debug, Clone, Default)]
pub struct SolutionLog {
    solutions: Arc<Mutex<Vec<(Work, u32)>>>,
}

impl SolutionLog {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn solutions(&self) -> Vec<(Work, u32)> {
        match self.solutions.lock() {
            Ok(solutions) => solutions.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.solutions().len()
    }
}

impl ResultSink for SolutionLog {
    fn submit(&mut self, work: &Work, nonce: u32) {
        let mut solutions = match self.solutions.lock() {
            Ok(solutions) => solutions,
            Err(poisoned) => poisoned.into_inner(),
        };
        solutions.push((work.clone(), nonce));
    }
}
