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

//! Simulated boards on the bus for tests

use crate::config::{MAX_ASICS, MAX_BOARDS};
use crate::error::{self, ErrorKind};
use crate::protocol::{self, NonceFound, Opcode, TestResults};
use crate::transport::Transport;

use packed_struct::PackedStruct;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct MockState {
    responder: Responder,
    /// Bytes waiting to be read
    rx: VecDeque<u8>,
    /// Every write as it was issued
    written: Vec<Vec<u8>>,
    /// Number of upcoming writes that fail
    failing_writes: usize,
}

/// Transport answering each write with bytes produced by a responder
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responder: Box::new(responder),
                rx: VecDeque::new(),
                written: Vec::new(),
                failing_writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport lock poisoned")
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    pub fn fail_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }
}

impl Transport for MockTransport {
    fn read_bytes(&mut self, len: usize) -> error::Result<Vec<u8>> {
        let mut state = self.lock();
        let len = len.min(state.rx.len());
        Ok(state.rx.drain(..len).collect())
    }

    fn write_bytes(&mut self, data: &[u8]) -> error::Result<()> {
        let mut state = self.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            Err(ErrorKind::Transport("simulated write failure".to_string()))?
        }
        state.written.push(data.to_vec());
        let response = (state.responder)(data);
        state.rx.extend(response);
        Ok(())
    }

    fn flush_input(&mut self) -> error::Result<()> {
        self.lock().rx.clear();
        Ok(())
    }
}

/// One simulated board
#[derive(Debug, Clone)]
pub struct SimBoard {
    /// Raw answer to `RequestTestResults`
    pub test_results: Vec<u8>,
    /// Raw answers to `PollStatus`, board answers idle when empty
    pub poll_answers: VecDeque<Vec<u8>>,
    /// Number of upcoming `SubmitJob` commands left unacknowledged
    pub ack_failures: usize,
    /// Job indices received by this board
    pub jobs: Vec<u8>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::with_faults(&[])
    }

    /// Board with given chips failing the chip test
    pub fn with_faults(faulty_chips: &[usize]) -> Self {
        let mut faults = vec![0u8; MAX_ASICS];
        for &chip in faulty_chips {
            faults[chip] = 1;
        }
        let results = TestResults {
            faults,
            clocks: vec![crate::config::DEFAULT_CLOCK; MAX_ASICS],
            diff_bits: 3,
            rolling: crate::config::DEFAULT_ROLLING,
            firmware: 0x12,
        };
        Self {
            test_results: results.to_bytes(),
            poll_answers: VecDeque::new(),
            ack_failures: 0,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RigState {
    pub boards: Vec<Option<SimBoard>>,
    /// Global commands seen on the bus
    pub global_commands: Vec<u8>,
}

impl RigState {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let (opcode, arg) = match request.first().and_then(|&b| protocol::decode_command(b)) {
            Some(cmd) => cmd,
            None => return Vec::new(),
        };
        let board = self
            .boards
            .get_mut(arg as usize)
            .and_then(|board| board.as_mut());
        match opcode {
            Opcode::Reset | Opcode::StopAndSetRolling | Opcode::SetClock | Opcode::SetDifficulty => {
                self.global_commands.push(request[0]);
                Vec::new()
            }
            Opcode::SubmitJob => match board {
                Some(board) if board.ack_failures > 0 => {
                    board.ack_failures -= 1;
                    Vec::new()
                }
                Some(board) => {
                    if let Some(&job_idx) = request.get(protocol::JOB_PAYLOAD_SIZE) {
                        board.jobs.push(job_idx);
                    }
                    vec![protocol::ACK_JOB]
                }
                None => Vec::new(),
            },
            Opcode::PollStatus => match board {
                Some(board) => board
                    .poll_answers
                    .pop_front()
                    .unwrap_or_else(|| vec![protocol::Status::Idle as u8]),
                None => Vec::new(),
            },
            Opcode::RequestTestResults => match board {
                Some(board) => board.test_results.clone(),
                None => Vec::new(),
            },
        }
    }
}

/// Set of simulated boards sharing one bus
#[derive(Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
    transport: MockTransport,
}

impl SimulatedRig {
    /// Rig with healthy boards in given slots
    pub fn new(slots: &[usize]) -> Self {
        let mut state = RigState {
            boards: vec![None; MAX_BOARDS],
            global_commands: Vec::new(),
        };
        for &slot in slots {
            state.boards[slot] = Some(SimBoard::new());
        }
        let state = Arc::new(Mutex::new(state));
        let responder_state = state.clone();
        let transport = MockTransport::new(move |request| {
            responder_state
                .lock()
                .expect("rig lock poisoned")
                .respond(request)
        });
        Self { state, transport }
    }

    pub fn transport(&self) -> MockTransport {
        self.transport.clone()
    }

    pub fn state(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().expect("rig lock poisoned")
    }

    pub fn set_board(&self, slot: usize, board: Option<SimBoard>) {
        self.state().boards[slot] = board;
    }

    pub fn with_board<F, R>(&self, slot: usize, f: F) -> R
    where
        F: FnOnce(&mut SimBoard) -> R,
    {
        let mut state = self.state();
        let board = state.boards[slot]
            .as_mut()
            .expect("simulated board is not present");
        f(board)
    }

    /// Queue raw answer to the next poll of the board
    pub fn queue_poll_answer(&self, slot: usize, answer: Vec<u8>) {
        self.with_board(slot, |board| board.poll_answers.push_back(answer));
    }

    /// Queue nonce found answer for the board
    pub fn queue_nonce(&self, slot: usize, job_idx: u8, chip: u8, nonce: u32) {
        self.queue_poll_answer(slot, nonce_answer(job_idx, chip, nonce));
    }

    pub fn global_commands(&self) -> Vec<u8> {
        self.state().global_commands.clone()
    }

    pub fn jobs(&self, slot: usize) -> Vec<u8> {
        self.with_board(slot, |board| board.jobs.clone())
    }
}

/// Raw `NonceFound` status followed by the nonce record
pub fn nonce_answer(job_idx: u8, chip: u8, nonce: u32) -> Vec<u8> {
    let record = NonceFound {
        nonce,
        job_idx,
        chip,
        ..Default::default()
    };
    let mut answer = vec![protocol::Status::NonceFound as u8];
    answer.extend_from_slice(&record.pack());
    answer
}
