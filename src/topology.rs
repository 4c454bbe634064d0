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

//! Registry of board slots and chips found on the bus
//!
//! Boards are discovered once at the start of the session by asking every slot for chip test
//! results. Physical boards don't come and go once wired, so a board that has answered the scan
//! stays present for the whole session even if it goes silent later.

use crate::config::{MAX_ASICS, MAX_BOARDS};
use crate::error::{self, ErrorKind};
use crate::protocol::{self, BoardCommand, TestResults};
use crate::transport::{Bus, Transport};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Presence {
    /// Slot hasn't been scanned yet
    Unknown,
    /// Board answered the scan
    Present,
    /// Nothing answered the scan in this slot
    Absent,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub presence: Presence,
    /// Last valid test results reported by the board
    pub test_results: Option<TestResults>,
}

impl Slot {
    fn new() -> Self {
        Self {
            presence: Presence::Unknown,
            test_results: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    slots: Vec<Slot>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::new(); MAX_BOARDS],
        }
    }

    /// Ask all slots for test results one by one. Returns ids of present boards.
    pub fn scan<T: Transport>(&mut self, bus: &Bus<T>) -> Vec<usize> {
        for board_id in 0..MAX_BOARDS {
            // failures only mean the slot is empty or the board is broken
            let _ = self.query_slot(bus, board_id);
        }
        self.present_boards()
    }

    /// Request test results from one slot and update the registry. A failed request never
    /// changes the presence of a board that has already been found.
    pub fn query_slot<T: Transport>(
        &mut self,
        bus: &Bus<T>,
        board_id: usize,
    ) -> error::Result<TestResults> {
        let result = Self::request_test_results(bus, board_id);
        let slot = self
            .slots
            .get_mut(board_id)
            .ok_or_else(|| ErrorKind::UnknownBoard(board_id))?;
        match result {
            Ok(test_results) => {
                slot.presence = Presence::Present;
                slot.test_results = Some(test_results.clone());
                Ok(test_results)
            }
            Err(e) => {
                if slot.presence == Presence::Unknown {
                    slot.presence = Presence::Absent;
                }
                Err(e)
            }
        }
    }

    fn request_test_results<T: Transport>(
        bus: &Bus<T>,
        board_id: usize,
    ) -> error::Result<TestResults> {
        let cmd = protocol::encode_board_command(BoardCommand::RequestTestResults, board_id)?;
        let response = bus.request(&[cmd], protocol::TEST_RESULTS_SIZE)?;
        protocol::decode_test_results(&response)
    }

    fn slot(&self, board_id: usize) -> error::Result<&Slot> {
        self.slots
            .get(board_id)
            .ok_or_else(|| ErrorKind::UnknownBoard(board_id).into())
    }

    pub fn presence(&self, board_id: usize) -> Presence {
        self.slots
            .get(board_id)
            .map_or(Presence::Absent, |slot| slot.presence)
    }

    #[inline]
    pub fn is_present(&self, board_id: usize) -> bool {
        self.presence(board_id) == Presence::Present
    }

    /// Present boards in increasing slot order
    pub fn present_boards(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.presence == Presence::Present)
            .map(|(board_id, _)| board_id)
            .collect()
    }

    /// Fail with `UnknownBoard` unless the board is present
    pub fn check_present(&self, board_id: usize) -> error::Result<()> {
        if !self.is_present(board_id) {
            Err(ErrorKind::UnknownBoard(board_id))?
        }
        Ok(())
    }

    /// Chip indices of a present board
    pub fn chips_of(&self, board_id: usize) -> error::Result<Vec<usize>> {
        self.check_present(board_id)?;
        Ok((0..MAX_ASICS).collect())
    }

    pub fn test_results(&self, board_id: usize) -> error::Result<Option<&TestResults>> {
        Ok(self.slot(board_id)?.test_results.as_ref())
    }
}
