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

//! Block Erupter board protocol
//!
//! Every exchange on the bus starts with one command byte. The top 3 bits select the command,
//! the bottom 5 bits carry either the board slot (board commands) or the argument of a global
//! command. Global commands are never answered, board commands are answered by the addressed
//! board only.
//!
//! This module is pure translation between values and byte frames, it doesn't do any I/O.

use crate::config::{MAX_ASICS, MAX_BOARDS};
use crate::error::{self, ErrorKind};
use crate::work::Work;

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;
use packed_struct_codegen::PrimitiveEnum_u8;

/// Mask of the command argument (board slot or global command value)
pub const ARG_MASK: u8 = 0x1f;

/// Size of SHA256 midstate
pub const MIDSTATE_SIZE: usize = 32;
/// Size of block header remainder that goes to the second chunk of SHA256
pub const HEADER_TAIL_SIZE: usize = 12;
pub const EXTRANONCE2_SIZE: usize = 4;

/// Size of job payload following the `SubmitJob` command byte
pub const JOB_PAYLOAD_SIZE: usize = MIDSTATE_SIZE + HEADER_TAIL_SIZE + EXTRANONCE2_SIZE + 1;

/// Size of nonce record following the `NonceFound` status byte
pub const NONCE_FOUND_SIZE: usize = 54;

/// Size of the answer to `RequestTestResults`
pub const TEST_RESULTS_SIZE: usize = 2 * MAX_ASICS + 3;

/// Answer to `SubmitJob` when the board took the job
pub const ACK_JOB: u8 = 0x58;

/// Command codes (top 3 bits of the command byte)
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum Opcode {
    /// Reset all boards
    Reset = 0,
    /// Stop jobs on all boards and set nTime rolling to `(arg + 1) * 30` seconds
    StopAndSetRolling = 1,
    /// Set clock of all boards to `(arg + 1) * 5` MHz
    SetClock = 2,
    /// Set difficulty bits of all boards from the low 2 bits of argument
    SetDifficulty = 3,
    /// Send job to the board
    SubmitJob = 4,
    /// Ask the board for its status
    PollStatus = 5,
    /// Ask the board for chip test results
    RequestTestResults = 6,
}

/// Command byte layout
#[derive(PackedStruct, Debug)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct Cmd {
    #[packed_field(bits = "0:4")]
    arg: Integer<u8, packed_bits::Bits5>,
    #[packed_field(bits = "5:7", ty = "enum")]
    opcode: Opcode,
}

impl Cmd {
    fn new(opcode: Opcode, arg: u8) -> error::Result<Self> {
        if arg > ARG_MASK {
            Err(ErrorKind::Encoding(format!(
                "argument {} of {:?} doesn't fit into 5 bits",
                arg, opcode
            )))?
        }
        Ok(Self {
            arg: arg.into(),
            opcode,
        })
    }

    #[inline]
    fn into_byte(self) -> u8 {
        self.pack()[0]
    }
}

/// Commands addressing all boards at once
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalCommand {
    Reset,
    StopAndSetRolling,
    SetClock,
    SetDifficulty,
}

impl GlobalCommand {
    fn opcode(self) -> Opcode {
        match self {
            GlobalCommand::Reset => Opcode::Reset,
            GlobalCommand::StopAndSetRolling => Opcode::StopAndSetRolling,
            GlobalCommand::SetClock => Opcode::SetClock,
            GlobalCommand::SetDifficulty => Opcode::SetDifficulty,
        }
    }
}

/// Commands addressing one board
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardCommand {
    SubmitJob,
    PollStatus,
    RequestTestResults,
}

impl BoardCommand {
    fn opcode(self) -> Opcode {
        match self {
            BoardCommand::SubmitJob => Opcode::SubmitJob,
            BoardCommand::PollStatus => Opcode::PollStatus,
            BoardCommand::RequestTestResults => Opcode::RequestTestResults,
        }
    }
}

/// Global command with the argument bits clear
pub fn encode_global_command(kind: GlobalCommand) -> u8 {
    Cmd::new(kind.opcode(), 0)
        .expect("BUG: zero argument doesn't fit")
        .into_byte()
}

/// Global command carrying a setting value (clock, rolling or difficulty bits) in the argument
/// bits
pub fn encode_global_setting(kind: GlobalCommand, value: u8) -> error::Result<u8> {
    Ok(Cmd::new(kind.opcode(), value)?.into_byte())
}

pub fn encode_board_command(kind: BoardCommand, board_id: usize) -> error::Result<u8> {
    if board_id >= MAX_BOARDS {
        Err(ErrorKind::UnknownBoard(board_id))?
    }
    Ok(Cmd::new(kind.opcode(), board_id as u8)?.into_byte())
}

/// Split command byte back to opcode and argument
pub fn decode_command(byte: u8) -> Option<(Opcode, u8)> {
    let cmd = Cmd::unpack(&[byte]).ok()?;
    Some((cmd.opcode, byte & ARG_MASK))
}

/// Job payload sent right after the `SubmitJob` command byte
#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct JobPayload {
    /// Internal state of SHA256 after processing the first chunk of block header
    pub midstate: [u8; 32],
    /// Remaining 12 bytes of block header (merkle root tail, time, bits)
    pub header_tail: [u8; 12],
    pub extranonce2: [u8; 4],
    /// Index of the job in the work window
    pub job_idx: u8,
}

fn check_width(field: &'static str, bytes: &[u8], width: usize) -> error::Result<()> {
    if bytes.len() != width {
        Err(ErrorKind::Encoding(format!(
            "{} has {} bytes instead of {}",
            field,
            bytes.len(),
            width
        )))?
    }
    Ok(())
}

impl JobPayload {
    pub fn new(work: &Work, job_idx: u8) -> error::Result<Self> {
        check_width("midstate", &work.midstate, MIDSTATE_SIZE)?;
        check_width("header remainder", &work.header_tail, HEADER_TAIL_SIZE)?;
        check_width("extranonce2", &work.extranonce2, EXTRANONCE2_SIZE)?;

        let mut payload = Self {
            job_idx,
            ..Default::default()
        };
        payload.midstate.copy_from_slice(&work.midstate);
        payload.header_tail.copy_from_slice(&work.header_tail);
        payload.extranonce2.copy_from_slice(&work.extranonce2);
        Ok(payload)
    }

    #[inline]
    pub fn into_bytes(self) -> [u8; JOB_PAYLOAD_SIZE] {
        self.pack()
    }
}

pub fn encode_job_payload(work: &Work, job_idx: u8) -> error::Result<[u8; JOB_PAYLOAD_SIZE]> {
    Ok(JobPayload::new(work, job_idx)?.into_bytes())
}

/// Status byte answered to `PollStatus`
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum Status {
    /// Board is waiting for a new job
    Idle = 0x56,
    /// Board is mining, no nonce yet
    Working = 0xa6,
    /// Board found a nonce, nonce record follows
    NonceFound = 0x5a,
}

pub fn decode_status_byte(byte: u8) -> error::Result<Status> {
    Status::from_primitive(byte).ok_or_else(|| ErrorKind::UnrecognizedStatus(byte).into())
}

/// Nonce record following the `NonceFound` status byte
#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq)]
#[packed_struct(endian = "lsb")]
pub struct NonceFound {
    pub midstate: [u8; 32],
    /// Least significant word of merkle root
    pub merkle: [u8; 4],
    pub ntime: u32,
    /// Difficulty bits of the block header
    pub diff: u32,
    pub extranonce2: [u8; 4],
    pub nonce: u32,
    /// Index of the job in the work window
    pub job_idx: u8,
    /// Chip on the board which found the nonce
    pub chip: u8,
}

pub fn decode_nonce_found(bytes: &[u8]) -> error::Result<NonceFound> {
    if bytes.len() < NONCE_FOUND_SIZE {
        Err(ErrorKind::ShortFrame {
            expected: NONCE_FOUND_SIZE,
            actual: bytes.len(),
        })?
    }
    let record = NonceFound::unpack_from_slice(&bytes[..NONCE_FOUND_SIZE]).map_err(|e| {
        ErrorKind::General(format!("nonce record unpacking failed: {:?}", e))
    })?;
    Ok(record)
}

/// Answer to `RequestTestResults`
#[derive(Debug, Clone, PartialEq)]
pub struct TestResults {
    /// Fault flags of each chip, zero means the chip passed the test
    pub faults: Vec<u8>,
    /// Clock setting each chip runs at
    pub clocks: Vec<u8>,
    pub diff_bits: u8,
    pub rolling: u8,
    pub firmware: u8,
}

impl TestResults {
    const FAULTS_OFFSET: usize = 0;
    const CLOCKS_OFFSET: usize = MAX_ASICS;
    const DIFF_BITS_OFFSET: usize = 2 * MAX_ASICS;
    const ROLLING_OFFSET: usize = 2 * MAX_ASICS + 1;
    const FIRMWARE_OFFSET: usize = 2 * MAX_ASICS + 2;

    pub fn is_faulty(&self, chip: usize) -> bool {
        self.faults.get(chip).map_or(false, |&fault| fault != 0)
    }

    pub fn faulty_chips(&self) -> impl Iterator<Item = usize> + '_ {
        self.faults
            .iter()
            .enumerate()
            .filter(|(_, &fault)| fault != 0)
            .map(|(chip, _)| chip)
    }

    /// Serialize the frame the way a board sends it
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; TEST_RESULTS_SIZE];
        let faults = self.faults.len().min(MAX_ASICS);
        let clocks = self.clocks.len().min(MAX_ASICS);
        bytes[Self::FAULTS_OFFSET..Self::FAULTS_OFFSET + faults]
            .copy_from_slice(&self.faults[..faults]);
        bytes[Self::CLOCKS_OFFSET..Self::CLOCKS_OFFSET + clocks]
            .copy_from_slice(&self.clocks[..clocks]);
        bytes[Self::DIFF_BITS_OFFSET] = self.diff_bits;
        bytes[Self::ROLLING_OFFSET] = self.rolling;
        bytes[Self::FIRMWARE_OFFSET] = self.firmware;
        bytes
    }
}

pub fn decode_test_results(bytes: &[u8]) -> error::Result<TestResults> {
    if bytes.len() < TEST_RESULTS_SIZE {
        Err(ErrorKind::ShortFrame {
            expected: TEST_RESULTS_SIZE,
            actual: bytes.len(),
        })?
    }
    Ok(TestResults {
        faults: bytes[TestResults::FAULTS_OFFSET..TestResults::CLOCKS_OFFSET].to_vec(),
        clocks: bytes[TestResults::CLOCKS_OFFSET..TestResults::DIFF_BITS_OFFSET].to_vec(),
        diff_bits: bytes[TestResults::DIFF_BITS_OFFSET],
        rolling: bytes[TestResults::ROLLING_OFFSET],
        firmware: bytes[TestResults::FIRMWARE_OFFSET],
    })
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    Idle,
    Working,
    NonceFound(NonceFound),
    TestResult(TestResults),
}

/// Decode answer to `PollStatus`: status byte optionally followed by the nonce record
pub fn decode_poll_response(bytes: &[u8]) -> error::Result<ResponseFrame> {
    let status = match bytes.first() {
        Some(&byte) => decode_status_byte(byte)?,
        None => Err(ErrorKind::ShortFrame {
            expected: 1,
            actual: 0,
        })?,
    };
    Ok(match status {
        Status::Idle => ResponseFrame::Idle,
        Status::Working => ResponseFrame::Working,
        Status::NonceFound => ResponseFrame::NonceFound(decode_nonce_found(&bytes[1..])?),
    })
}
