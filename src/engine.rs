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

//! Dispatch and polling engine
//!
//! The engine is an explicit state machine driven by `step`. One cycle goes through
//! `Idle -> Dispatching -> Polling` and every `calibration_interval` cycles through
//! `Calibrating` as well. All bus exchanges are done from the engine thread, one
//! request/response pair at a time.

use crate::config::{self, Config, Settings, MAX_ASICS};
use crate::device::Device;
use crate::error::{self, ErrorKind};
use crate::logging::macros::*;
use crate::protocol::{self, BoardCommand, GlobalCommand, NonceFound, ResponseFrame, Status};
use crate::shutdown;
use crate::stats::DeviceSnapshot;
use crate::topology::Presence;
use crate::transport::{Bus, Transport};
use crate::window::{NonceStatus, WorkItem};
use crate::work::{ResultSink, Work, WorkSource};

use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Scanning,
    Idle,
    Dispatching,
    Polling,
    Calibrating,
    Stopped,
}

/// What happened to one board during a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Working,
    /// Fresh nonce for work in the window
    Accepted { job_idx: u8, chip: usize, nonce: u32 },
    /// Nonce already accounted for its work
    Rejected { job_idx: u8, chip: usize, nonce: u32 },
    /// Nonce for work that isn't in the window or belongs to another board
    HardwareError { job_idx: u8, chip: usize },
    /// Nonce reported by chip which doesn't exist
    Ignored { chip: usize },
    /// Malformed or short frame
    Glitch,
    /// Board didn't answer
    Timeout,
}

/// Latest device snapshot shared with readers outside of the engine thread
#[derive(Debug, Clone, Default)]
pub struct SnapshotCell(Arc<RwLock<Option<DeviceSnapshot>>>);

impl SnapshotCell {
    pub fn get(&self) -> Option<DeviceSnapshot> {
        match self.0.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, snapshot: DeviceSnapshot) {
        let mut cell = match self.0.write() {
            Ok(cell) => cell,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cell = Some(snapshot);
    }
}

pub struct Engine<T, W, R> {
    state: State,
    device: Device,
    bus: Bus<T>,
    source: W,
    sink: R,
    /// Round robin cursor, the lowest slot considered for the next job
    next_board: usize,
    /// Work whose submission failed, it goes out first in the next cycle
    backlog: Option<Work>,
    cycles: u64,
    snapshot: SnapshotCell,
}

impl<T, W, R> Engine<T, W, R>
where
    T: Transport,
    W: WorkSource,
    R: ResultSink,
{
    pub fn new(config: Config, bus: Bus<T>, source: W, sink: R) -> error::Result<Self> {
        config.validate()?;
        Ok(Self {
            state: State::Scanning,
            device: Device::new(config),
            bus,
            source,
            sink,
            next_board: 0,
            backlog: None,
            cycles: 0,
            snapshot: SnapshotCell::default(),
        })
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Cell that receives a fresh snapshot after every cycle
    pub fn snapshot_cell(&self) -> SnapshotCell {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.device.snapshot(Instant::now())
    }

    /// Replace operator settings, the boards pick them up at the next calibration
    pub fn request_settings(&mut self, settings: Settings) -> error::Result<()> {
        settings.validate()?;
        info!(
            "Requested clock {} MHz, difficulty {}, rolling {} s",
            settings.clock_mhz(),
            settings.difficulty,
            settings.rolling_window().as_secs()
        );
        self.device.config.set_settings(settings);
        Ok(())
    }

    /// Run one transition of the state machine and return the new state
    pub fn step(&mut self) -> error::Result<State> {
        let now = Instant::now();
        self.state = match self.state {
            State::Scanning => {
                self.start()?;
                State::Idle
            }
            State::Idle => State::Dispatching,
            State::Dispatching => {
                self.dispatch(now)?;
                State::Polling
            }
            State::Polling => {
                self.poll_all(now)?;
                self.cycles += 1;
                self.snapshot.publish(self.device.snapshot(now));
                if self.cycles % self.device.config.calibration_interval == 0 {
                    State::Calibrating
                } else {
                    State::Idle
                }
            }
            State::Calibrating => {
                self.calibrate()?;
                State::Idle
            }
            State::Stopped => State::Stopped,
        };
        Ok(self.state)
    }

    /// Drive the engine until shutdown is requested or a fatal error occurs. Shutdown is
    /// checked between cycles only.
    pub fn run(&mut self, shutdown: &mut shutdown::Receiver) -> error::Result<()> {
        loop {
            if self.state == State::Idle || self.state == State::Scanning {
                if let Some(msg) = shutdown.try_receive() {
                    info!("Shutting down: {}", msg);
                    self.stop();
                    return Ok(());
                }
            }
            match self.step() {
                Ok(State::Idle) => thread::sleep(self.device.config.poll_delay()),
                Ok(State::Stopped) => return Ok(()),
                Ok(_) => (),
                Err(e) => {
                    error!("Engine failed: {}", e);
                    self.stop();
                    return Err(e);
                }
            }
        }
    }

    /// Discard in-flight work and stop the session
    pub fn stop(&mut self) {
        let dropped = self.device.window.clear();
        if dropped > 0 {
            debug!("Discarded {} jobs in flight", dropped);
        }
        self.backlog = None;
        self.state = State::Stopped;
        self.snapshot.publish(self.device.snapshot(Instant::now()));
    }

    /// Reset the boards, discover them and apply settings
    pub fn start(&mut self) -> error::Result<()> {
        if self.device.config.reset_on_start {
            info!("Resetting boards");
            let reset = protocol::encode_global_command(GlobalCommand::Reset);
            match self.bus.send(&[reset]) {
                Ok(()) => thread::sleep(self.device.config.reset_settle()),
                Err(ref e) if !e.is_fatal() => warn!("Reset failed: {}", e),
                Err(e) => return Err(e),
            }
        }

        let boards = self.device.topology.scan(&self.bus);
        if boards.is_empty() {
            Err(ErrorKind::NoBoards)?
        }
        info!("Found {} boards: {:?}", boards.len(), boards);

        for &board_id in &boards {
            self.device.stats.attach_board(board_id);
            let faulty: Vec<usize> = match self.device.topology.test_results(board_id)? {
                Some(test_results) => test_results.faulty_chips().collect(),
                None => Vec::new(),
            };
            for chip in faulty {
                if self.device.stats.mark_bad(board_id, chip) {
                    warn!("Board {} chip {} failed the chip test", board_id, chip);
                }
            }
        }
        self.device.started = Instant::now();
        self.device.stats.started = self.device.started;
        self.calibrate()
    }

    /// Request test results of one board again. A board that doesn't answer keeps its
    /// presence.
    pub fn query_board(&mut self, board_id: usize) -> error::Result<protocol::TestResults> {
        let result = self.device.topology.query_slot(&self.bus, board_id);
        if let Err(ref e) = result {
            if self.device.topology.presence(board_id) == Presence::Present {
                warn!("Board {} failed to report test results: {}", board_id, e);
            }
        }
        result
    }

    /// Next present board in round robin order
    fn next_target(&mut self) -> Option<usize> {
        let boards = self.device.topology.present_boards();
        let board_id = boards
            .iter()
            .cloned()
            .find(|&board_id| board_id >= self.next_board)
            .or_else(|| boards.first().cloned())?;
        self.next_board = board_id + 1;
        Some(board_id)
    }

    /// Submit one piece of work. A full window evicts its oldest work once the new job is
    /// acknowledged.
    pub fn dispatch(&mut self, now: Instant) -> error::Result<()> {
        let expired = self.device.window.expire(now, self.device.config.job_timeout());
        if !expired.is_empty() {
            debug!("{} jobs expired without result", expired.len());
        }
        let work = match self.backlog.take().or_else(|| self.source.next_work()) {
            Some(work) => work,
            None => return Ok(()),
        };
        let board_id = match self.next_target() {
            Some(board_id) => board_id,
            None => {
                self.backlog = Some(work);
                return Ok(());
            }
        };
        let job_idx = match self.device.window.alloc_job_idx() {
            Some(job_idx) => job_idx,
            None => {
                // every job index is in flight
                if let Some(evicted) = self.device.window.evict_oldest() {
                    debug!("Job {} evicted from full window", evicted.job_idx);
                }
                self.device
                    .window
                    .alloc_job_idx()
                    .expect("BUG: no free job index after eviction")
            }
        };

        let mut frame = Vec::with_capacity(1 + protocol::JOB_PAYLOAD_SIZE);
        frame.push(protocol::encode_board_command(
            BoardCommand::SubmitJob,
            board_id,
        )?);
        frame.extend_from_slice(&protocol::encode_job_payload(&work, job_idx)?);

        for attempt in 1..=self.device.config.submit_retries {
            match self.bus.request(&frame, 1) {
                Ok(ref ack) if ack.as_slice() == [protocol::ACK_JOB] => {
                    trace!("Board {} took job {}", board_id, job_idx);
                    let item = WorkItem::new(job_idx, board_id, work, now);
                    if let Some(evicted) = self.device.window.push(item) {
                        debug!("Job {} evicted from full window", evicted.job_idx);
                    }
                    self.device.stats.on_job_submitted(board_id);
                    self.device.last_job = Some(now);
                    return Ok(());
                }
                Ok(ack) => debug!(
                    "Board {} job {} attempt {}: unexpected acknowledgement {:02x?}",
                    board_id, job_idx, attempt, ack
                ),
                Err(e) => {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    debug!(
                        "Board {} job {} attempt {}: {}",
                        board_id, job_idx, attempt, e
                    );
                }
            }
        }
        warn!(
            "Board {} didn't acknowledge job {}, work is kept for the next cycle",
            board_id, job_idx
        );
        self.backlog = Some(work);
        Ok(())
    }

    /// Poll all present boards in increasing slot order
    pub fn poll_all(&mut self, now: Instant) -> error::Result<Vec<(usize, PollOutcome)>> {
        let mut outcomes = Vec::new();
        for board_id in self.device.topology.present_boards() {
            outcomes.push((board_id, self.poll_board(board_id, now)?));
        }
        Ok(outcomes)
    }

    /// Poll one board and account the response
    pub fn poll_board(&mut self, board_id: usize, now: Instant) -> error::Result<PollOutcome> {
        self.device.topology.check_present(board_id)?;
        let cmd = protocol::encode_board_command(BoardCommand::PollStatus, board_id)?;

        let response = self.bus.transaction(|io| {
            io.write_bytes(&[cmd])?;
            let mut response = io.read_bytes(1)?;
            if response.first() == Some(&(Status::NonceFound as u8)) {
                response.extend(io.read_bytes(protocol::NONCE_FOUND_SIZE)?);
            }
            Ok(response)
        });
        let response = match response {
            Ok(ref response) if response.is_empty() => return Ok(self.on_timeout(board_id, None)),
            Ok(response) => response,
            Err(e) => {
                if e.is_fatal() {
                    return Err(e);
                }
                return Ok(self.on_timeout(board_id, Some(e)));
            }
        };

        if self.device.stats.on_board_responded(board_id) {
            info!("Board {} responds again", board_id);
        }
        let frame = match protocol::decode_poll_response(&response) {
            Ok(frame) => frame,
            Err(e) => {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!("Board {}: {}", board_id, e);
                self.device.stats.on_glitch(board_id);
                return Ok(PollOutcome::Glitch);
            }
        };
        Ok(match frame {
            ResponseFrame::Idle => PollOutcome::Idle,
            ResponseFrame::Working => PollOutcome::Working,
            ResponseFrame::NonceFound(record) => self.on_nonce_found(board_id, record, now),
            ResponseFrame::TestResult(_) => {
                self.device.stats.on_glitch(board_id);
                PollOutcome::Glitch
            }
        })
    }

    fn on_timeout(&mut self, board_id: usize, e: Option<error::Error>) -> PollOutcome {
        match e {
            Some(e) => debug!("Board {} poll failed: {}", board_id, e),
            None => debug!("Board {} poll timed out", board_id),
        }
        if self.device.stats.on_board_timeout(board_id) {
            warn!(
                "Board {} is unresponsive after {} timeouts",
                board_id, self.device.config.unresponsive_timeouts
            );
        }
        PollOutcome::Timeout
    }

    /// Match nonce record against work in the window
    fn on_nonce_found(&mut self, board_id: usize, record: NonceFound, now: Instant) -> PollOutcome {
        let chip = record.chip as usize;
        let job_idx = record.job_idx;
        let nonce = record.nonce;
        if chip >= MAX_ASICS {
            debug!("Board {} reported nonce from chip {}", board_id, chip);
            self.device.stats.ignore_event();
            return PollOutcome::Ignored { chip };
        }

        let max_nonces = self.device.config.max_nonces_per_job;
        let item = match self.device.window.find_mut(job_idx) {
            Some(item) if item.board == board_id => item,
            _ => {
                debug!(
                    "Board {} chip {} nonce {:08x} for job {} not in flight",
                    board_id, chip, nonce, job_idx
                );
                self.device.stats.on_hardware_error(board_id, Some(chip));
                if self.device.stats.mark_bad_if_needed(board_id, chip) {
                    let hwe = self
                        .device
                        .stats
                        .chip(board_id, chip)
                        .map_or(0.0, |chip| chip.hwe());
                    warn!(
                        "Board {} chip {} marked bad, hardware error rate {:.2}",
                        board_id, chip, hwe
                    );
                }
                return PollOutcome::HardwareError { job_idx, chip };
            }
        };

        match item.insert_nonce(nonce) {
            NonceStatus::Duplicate => {
                debug!(
                    "Board {} chip {} duplicate nonce {:08x} for job {}",
                    board_id, chip, nonce, job_idx
                );
                self.device.stats.on_nonce_rejected(board_id, chip);
                PollOutcome::Rejected {
                    job_idx,
                    chip,
                    nonce,
                }
            }
            NonceStatus::Fresh => {
                self.sink.submit(&item.work, nonce);
                let terminal = item.nonce_count() >= max_nonces;
                if terminal {
                    self.device.window.retire(job_idx);
                }
                trace!(
                    "Board {} chip {} nonce {:08x} for job {}",
                    board_id,
                    chip,
                    nonce,
                    job_idx
                );
                self.device.stats.on_nonce_accepted(board_id, chip, now);
                PollOutcome::Accepted {
                    job_idx,
                    chip,
                    nonce,
                }
            }
        }
    }

    /// Send global settings which differ from the ones last applied. Settings that failed to
    /// go out are sent again next time.
    pub fn calibrate(&mut self) -> error::Result<()> {
        let requested = self.device.settings();
        let applied = self.device.applied;
        if applied == Some(requested) {
            return Ok(());
        }

        let mut commands = Vec::new();
        if applied.map(|s| s.clock) != Some(requested.clock) {
            commands.push(protocol::encode_global_setting(
                GlobalCommand::SetClock,
                requested.clock,
            )?);
        }
        if applied.map(|s| s.difficulty) != Some(requested.difficulty) {
            commands.push(protocol::encode_global_setting(
                GlobalCommand::SetDifficulty,
                config::difficulty_bits(requested.difficulty)?,
            )?);
        }
        let rolling_changed = applied.map(|s| s.rolling) != Some(requested.rolling);
        if rolling_changed {
            commands.push(protocol::encode_global_setting(
                GlobalCommand::StopAndSetRolling,
                requested.rolling,
            )?);
        }

        for cmd in commands {
            if let Err(e) = self.bus.send(&[cmd]) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Calibration command {:#04x} failed: {}", cmd, e);
                return Ok(());
            }
        }

        if rolling_changed {
            // boards dropped their jobs
            let dropped = self.device.window.clear();
            if dropped > 0 {
                debug!("Dropped {} jobs stopped by rolling change", dropped);
            }
        }
        self.device.stats.set_difficulty(requested.difficulty);
        self.device.applied = Some(requested);
        info!(
            "Applied clock {} MHz, difficulty {}, rolling {} s",
            requested.clock_mhz(),
            requested.difficulty,
            requested.rolling_window().as_secs()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{self, MockTransport, SimBoard, SimulatedRig};
    use crate::work::{NullWork, SolutionLog};

    use std::time::Duration;

    type TestEngine = Engine<MockTransport, NullWork, SolutionLog>;

    fn test_config() -> Config {
        Config {
            reset_settle_ms: 0,
            poll_delay_ms: 0,
            ..Default::default()
        }
    }

    fn engine_with(rig: &SimulatedRig, config: Config) -> (TestEngine, SolutionLog) {
        let sink = SolutionLog::new();
        let engine = Engine::new(
            config,
            Bus::new(rig.transport()),
            NullWork::new(),
            sink.clone(),
        )
        .expect("valid config");
        (engine, sink)
    }

    fn started(rig: &SimulatedRig, config: Config) -> (TestEngine, SolutionLog) {
        let (mut engine, sink) = engine_with(rig, config);
        assert_eq!(engine.step().expect("scan"), State::Idle);
        (engine, sink)
    }

    fn assert_counters_untouched(engine: &TestEngine) {
        let stats = &engine.device().stats;
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.nonces, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.ignored, 0);
    }

    #[test]
    fn test_start_scans_and_applies_settings() {
        let rig = SimulatedRig::new(&[1, 3]);
        let (engine, _) = started(&rig, test_config());

        assert_eq!(engine.device().topology.present_boards(), vec![1, 3]);
        assert!(engine.device().stats.board(1).is_some());
        assert!(engine.device().stats.board(2).is_none());
        // reset, clock 23, difficulty 64, rolling 5
        assert_eq!(rig.global_commands(), vec![0x00, 0x57, 0x63, 0x25]);
        assert_eq!(engine.device().applied, Some(Settings::default()));
    }

    #[test]
    fn test_no_boards() {
        let rig = SimulatedRig::new(&[]);
        let (mut engine, _) = engine_with(&rig, test_config());
        match engine.step().map_err(|e| e.kind()) {
            Err(ErrorKind::NoBoards) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn test_faulty_chips_are_latched_bad() {
        let rig = SimulatedRig::new(&[]);
        rig.set_board(2, Some(SimBoard::with_faults(&[4, 40])));
        let (engine, _) = started(&rig, test_config());

        let stats = &engine.device().stats;
        assert!(stats.is_bad(2, 4));
        assert!(stats.is_bad(2, 40));
        assert!(!stats.is_bad(2, 5));
    }

    #[test]
    fn test_idle_board_changes_nothing() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, _) = started(&rig, test_config());

        rig.queue_poll_answer(3, vec![0x56]);
        assert_eq!(
            engine.poll_board(3, Instant::now()).expect("poll"),
            PollOutcome::Idle
        );
        rig.queue_poll_answer(3, vec![0xa6]);
        assert_eq!(
            engine.poll_board(3, Instant::now()).expect("poll"),
            PollOutcome::Working
        );
        assert_counters_untouched(&engine);
    }

    #[test]
    fn test_matching_nonce_is_accepted() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, sink) = started(&rig, test_config());
        let now = Instant::now();

        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(3), vec![0]);
        assert_eq!(engine.device().window.len(), 1);

        rig.queue_nonce(3, 0, 7, 0xdead_beef);
        assert_eq!(
            engine.poll_board(3, now).expect("poll"),
            PollOutcome::Accepted {
                job_idx: 0,
                chip: 7,
                nonce: 0xdead_beef
            }
        );

        let stats = &engine.device().stats;
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.board(3).expect("attached").accepted, 1);
        assert_eq!(stats.chip(3, 7).expect("chip").accepted, 1);
        assert_eq!(stats.errors, 0);
        // work is retired
        assert!(engine.device().window.is_empty());
        assert_eq!(sink.solutions(), vec![(NullWork::prepare(0), 0xdead_beef)]);
    }

    #[test]
    fn test_unknown_job_is_hardware_error() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, sink) = started(&rig, test_config());

        rig.queue_nonce(3, 42, 1, 5);
        assert_eq!(
            engine.poll_board(3, Instant::now()).expect("poll"),
            PollOutcome::HardwareError {
                job_idx: 42,
                chip: 1
            }
        );
        let stats = &engine.device().stats;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.chip(3, 1).expect("chip").errors, 1);
        assert_eq!(stats.accepted, 0);
        assert_eq!(sink.len(), 0);
    }

    #[test]
    fn test_nonce_from_other_board_is_hardware_error() {
        let rig = SimulatedRig::new(&[1, 2]);
        let (mut engine, _) = started(&rig, test_config());
        let now = Instant::now();

        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(1), vec![0]);
        rig.queue_nonce(2, 0, 0, 1);
        assert_eq!(
            engine.poll_board(2, now).expect("poll"),
            PollOutcome::HardwareError { job_idx: 0, chip: 0 }
        );
        // job stays in flight for its own board
        assert!(engine.device().window.contains(0));
    }

    #[test]
    fn test_duplicate_nonce_is_rejected() {
        let rig = SimulatedRig::new(&[0]);
        let config = Config {
            max_nonces_per_job: 2,
            ..test_config()
        };
        let (mut engine, sink) = started(&rig, config);
        let now = Instant::now();
        engine.dispatch(now).expect("dispatch");

        rig.queue_nonce(0, 0, 3, 100);
        rig.queue_nonce(0, 0, 3, 100);
        rig.queue_nonce(0, 0, 3, 200);
        assert!(matches!(
            engine.poll_board(0, now).expect("poll"),
            PollOutcome::Accepted { .. }
        ));
        assert!(engine.device().window.contains(0));
        assert!(matches!(
            engine.poll_board(0, now).expect("poll"),
            PollOutcome::Rejected { .. }
        ));
        assert!(matches!(
            engine.poll_board(0, now).expect("poll"),
            PollOutcome::Accepted { .. }
        ));
        assert!(!engine.device().window.contains(0));

        let stats = &engine.device().stats;
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_absent_board_is_unknown() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, _) = started(&rig, test_config());

        for board_id in &[0, 5, 31, 32] {
            match engine
                .poll_board(*board_id, Instant::now())
                .map_err(|e| e.kind())
            {
                Err(ErrorKind::UnknownBoard(id)) => assert_eq!(id, *board_id),
                r => panic!("unexpected result {:?}", r),
            }
        }
    }

    #[test]
    fn test_malformed_frames_are_glitches() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, _) = started(&rig, test_config());

        // nonce record cut short
        rig.queue_poll_answer(3, vec![0x5a, 1, 2, 3]);
        // unrecognized status
        rig.queue_poll_answer(3, vec![0x11]);
        for _ in 0..2 {
            assert_eq!(
                engine.poll_board(3, Instant::now()).expect("poll"),
                PollOutcome::Glitch
            );
        }
        assert_counters_untouched(&engine);
        assert_eq!(engine.device().stats.board(3).expect("attached").glitches, 2);
    }

    #[test]
    fn test_nonexistent_chip_is_ignored() {
        let rig = SimulatedRig::new(&[3]);
        let (mut engine, _) = started(&rig, test_config());

        rig.queue_nonce(3, 0, MAX_ASICS as u8, 1);
        assert_eq!(
            engine.poll_board(3, Instant::now()).expect("poll"),
            PollOutcome::Ignored { chip: MAX_ASICS }
        );
        assert_eq!(engine.device().stats.ignored, 1);
        assert_eq!(engine.device().stats.errors, 0);
    }

    #[test]
    fn test_silent_board_stays_present() {
        let rig = SimulatedRig::new(&[3]);
        let config = Config {
            unresponsive_timeouts: 2,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);
        let backup = rig.with_board(3, |board| board.clone());
        rig.set_board(3, None);

        for _ in 0..3 {
            assert_eq!(
                engine.poll_board(3, Instant::now()).expect("poll"),
                PollOutcome::Timeout
            );
        }
        assert!(engine.device().topology.is_present(3));
        let board = engine.device().stats.board(3).expect("attached");
        assert!(board.unresponsive);
        assert_eq!(board.timeouts, 3);
        assert_eq!(board.errors, 3);

        rig.set_board(3, Some(backup));
        assert_eq!(
            engine.poll_board(3, Instant::now()).expect("poll"),
            PollOutcome::Idle
        );
        assert!(!engine.device().stats.board(3).expect("attached").unresponsive);
    }

    #[test]
    fn test_silent_board_leaves_expected_hashrate() {
        let rig = SimulatedRig::new(&[0, 1]);
        let config = Config {
            unresponsive_timeouts: 2,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);
        let clock_hz = config::clock_mhz(config::DEFAULT_CLOCK) as f64 * 1e6;
        let expected = |engine: &TestEngine| {
            engine
                .device()
                .stats
                .expected_hashrate(config::DEFAULT_CLOCK)
        };
        assert!((expected(&engine) - 2.0 * MAX_ASICS as f64 * clock_hz).abs() < 1.0);

        let backup = rig.with_board(1, |board| board.clone());
        rig.set_board(1, None);
        for _ in 0..2 {
            engine.poll_board(1, Instant::now()).expect("poll");
        }
        assert!(engine.device().stats.board(1).expect("attached").unresponsive);
        assert!((expected(&engine) - MAX_ASICS as f64 * clock_hz).abs() < 1.0);
        let snapshot = engine.snapshot();
        assert!((snapshot.expected_hashrate - MAX_ASICS as f64 * clock_hz).abs() < 1.0);

        rig.set_board(1, Some(backup));
        assert_eq!(
            engine.poll_board(1, Instant::now()).expect("poll"),
            PollOutcome::Idle
        );
        assert!((expected(&engine) - 2.0 * MAX_ASICS as f64 * clock_hz).abs() < 1.0);
    }

    #[test]
    fn test_poll_write_failure_is_timeout() {
        let rig = SimulatedRig::new(&[4]);
        let (mut engine, _) = started(&rig, test_config());

        rig.transport().fail_writes(1);
        assert_eq!(
            engine.poll_board(4, Instant::now()).expect("poll"),
            PollOutcome::Timeout
        );
        let board = engine.device().stats.board(4).expect("attached");
        assert_eq!(board.timeouts, 1);
        assert_eq!(board.errors, 1);
        assert_eq!(board.glitches, 0);
        assert!(engine.device().topology.is_present(4));

        assert_eq!(
            engine.poll_board(4, Instant::now()).expect("poll"),
            PollOutcome::Idle
        );
        assert_eq!(
            engine
                .device()
                .stats
                .board(4)
                .expect("attached")
                .consecutive_timeouts,
            0
        );
    }

    #[test]
    fn test_short_test_results_keep_presence() {
        let rig = SimulatedRig::new(&[2]);
        let (mut engine, _) = started(&rig, test_config());

        rig.with_board(2, |board| {
            board.test_results.truncate(protocol::TEST_RESULTS_SIZE - 1)
        });
        match engine.query_board(2).map_err(|e| e.kind()) {
            Err(ErrorKind::ShortFrame { expected, actual }) => {
                assert_eq!(expected, protocol::TEST_RESULTS_SIZE);
                assert_eq!(actual, protocol::TEST_RESULTS_SIZE - 1);
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(engine.device().topology.presence(2), Presence::Present);

        // absent slot stays absent
        assert!(engine.query_board(4).is_err());
        assert_eq!(engine.device().topology.presence(4), Presence::Absent);
    }

    #[test]
    fn test_round_robin_dispatch() {
        let rig = SimulatedRig::new(&[0, 5, 9]);
        let (mut engine, _) = started(&rig, test_config());
        let now = Instant::now();

        for _ in 0..4 {
            engine.dispatch(now).expect("dispatch");
        }
        assert_eq!(rig.jobs(0), vec![0, 3]);
        assert_eq!(rig.jobs(5), vec![1]);
        assert_eq!(rig.jobs(9), vec![2]);
        assert_eq!(engine.device().stats.board(0).expect("attached").jobs, 2);
        assert!(engine.device().last_job.is_some());
    }

    #[test]
    fn test_submit_retries() {
        let rig = SimulatedRig::new(&[0]);
        let (mut engine, _) = started(&rig, test_config());
        let now = Instant::now();

        // acknowledged on the last attempt
        rig.with_board(0, |board| board.ack_failures = 2);
        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(0), vec![0]);

        // never acknowledged, work is kept for the next cycle
        rig.with_board(0, |board| board.ack_failures = 3);
        engine.dispatch(now).expect("dispatch");
        assert_eq!(engine.device().window.len(), 1);
        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(0), vec![0, 2]);
        assert_eq!(
            engine.device().window.find(2).map(|item| item.work.clone()),
            Some(NullWork::prepare(1))
        );
    }

    #[test]
    fn test_submit_write_failures_are_retried() {
        let rig = SimulatedRig::new(&[0]);
        let (mut engine, _) = started(&rig, test_config());
        let now = Instant::now();

        // delivered on the last attempt
        rig.transport().fail_writes(2);
        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(0), vec![0]);
        assert_eq!(engine.device().window.len(), 1);

        // every attempt fails, work is kept for the next cycle
        rig.transport().fail_writes(3);
        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(0), vec![0]);
        assert_eq!(engine.device().window.len(), 1);
        assert_eq!(engine.device().stats.board(0).expect("attached").jobs, 1);

        engine.dispatch(now).expect("dispatch");
        assert_eq!(rig.jobs(0), vec![0, 2]);
        assert_eq!(
            engine.device().window.find(2).map(|item| item.work.clone()),
            Some(NullWork::prepare(1))
        );
    }

    #[test]
    fn test_window_is_bounded() {
        let rig = SimulatedRig::new(&[0, 1]);
        let config = Config {
            work_window: 4,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);
        let now = Instant::now();

        for _ in 0..10 {
            engine.dispatch(now).expect("dispatch");
            assert!(engine.device().window.len() <= 4);
        }
        // full window keeps taking work and drops the oldest
        assert_eq!(rig.jobs(0), vec![0, 2, 4, 6, 8]);
        assert_eq!(rig.jobs(1), vec![1, 3, 5, 7, 9]);
        let mut in_flight: Vec<u8> = engine
            .device()
            .window
            .iter()
            .map(|item| item.job_idx)
            .collect();
        in_flight.sort();
        assert_eq!(in_flight, vec![6, 7, 8, 9]);

        // old work expires and makes room
        let later = now + engine.device().config.job_timeout() + Duration::from_secs(1);
        engine.dispatch(later).expect("dispatch");
        assert_eq!(engine.device().window.len(), 1);
        assert!(engine.device().window.contains(10));
    }

    #[test]
    fn test_full_job_idx_space_keeps_dispatching() {
        let rig = SimulatedRig::new(&[0]);
        let config = Config {
            work_window: 256,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);
        let now = Instant::now();

        for _ in 0..300 {
            engine.dispatch(now).expect("dispatch");
        }
        assert_eq!(rig.jobs(0).len(), 300);
        assert_eq!(engine.device().window.len(), 256);
        assert_eq!(engine.device().stats.board(0).expect("attached").jobs, 300);
        // the newest job reuses the index of the oldest evicted one
        assert!(engine.device().window.contains(299u32 as u8));
    }

    #[test]
    fn test_bad_chip_is_marked_once() {
        let rig = SimulatedRig::new(&[3]);
        let config = Config {
            bad_chip_threshold: 0.5,
            bad_chip_min_samples: 3,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);

        for i in 0..6 {
            rig.queue_nonce(3, 100 + i, 9, 1);
            engine.poll_board(3, Instant::now()).expect("poll");
            assert_eq!(engine.device().stats.is_bad(3, 9), i >= 2);
        }
        assert!(!engine.device().stats.is_bad(3, 8));
        assert_bad_chip_not_expected(&engine);
    }

    fn assert_bad_chip_not_expected(engine: &TestEngine) {
        let clock_hz = config::clock_mhz(config::DEFAULT_CLOCK) as f64 * 1e6;
        let expected = engine
            .device()
            .stats
            .expected_hashrate(config::DEFAULT_CLOCK);
        assert!((expected - (MAX_ASICS - 1) as f64 * clock_hz).abs() < 1.0);
    }

    #[test]
    fn test_calibration_sends_changes_only() {
        let rig = SimulatedRig::new(&[0]);
        let (mut engine, _) = started(&rig, test_config());
        rig.state().global_commands.clear();

        // nothing changed
        engine.calibrate().expect("calibrate");
        assert!(rig.global_commands().is_empty());

        engine.dispatch(Instant::now()).expect("dispatch");
        engine
            .request_settings(Settings {
                clock: 20,
                ..Settings::default()
            })
            .expect("valid settings");
        engine.calibrate().expect("calibrate");
        assert_eq!(rig.global_commands(), vec![0x54]);
        assert_eq!(engine.device().window.len(), 1);

        rig.state().global_commands.clear();
        engine
            .request_settings(Settings {
                clock: 20,
                difficulty: 16,
                rolling: 1,
            })
            .expect("valid settings");
        engine.calibrate().expect("calibrate");
        assert_eq!(rig.global_commands(), vec![0x62, 0x21]);
        // rolling change stops all jobs
        assert!(engine.device().window.is_empty());

        assert!(engine
            .request_settings(Settings {
                clock: 30,
                ..Settings::default()
            })
            .is_err());
    }

    #[test]
    fn test_failed_calibration_is_retried() {
        let rig = SimulatedRig::new(&[0]);
        let (mut engine, _) = started(&rig, test_config());
        rig.state().global_commands.clear();
        let requested = Settings {
            clock: 20,
            ..Settings::default()
        };
        engine.request_settings(requested).expect("valid settings");

        rig.transport().fail_writes(1);
        engine.calibrate().expect("calibrate");
        assert!(rig.global_commands().is_empty());
        assert_eq!(engine.device().applied, Some(Settings::default()));

        engine.calibrate().expect("calibrate");
        assert_eq!(rig.global_commands(), vec![0x54]);
        assert_eq!(engine.device().applied, Some(requested));
    }

    #[test]
    fn test_cycle() {
        let rig = SimulatedRig::new(&[0]);
        let config = Config {
            calibration_interval: 2,
            ..test_config()
        };
        let (mut engine, _) = started(&rig, config);
        let cell = engine.snapshot_cell();
        assert!(cell.get().is_none());

        let states: Vec<State> = (0..7).map(|_| engine.step().expect("step")).collect();
        assert_eq!(
            states,
            vec![
                State::Dispatching,
                State::Polling,
                State::Idle,
                State::Dispatching,
                State::Polling,
                State::Calibrating,
                State::Idle,
            ]
        );
        let snapshot = cell.get().expect("published");
        assert_eq!(snapshot.boards.len(), 1);
        assert_eq!(snapshot.boards[0].jobs, 2);
        assert_eq!(snapshot.work_in_flight, 2);
    }

    #[test]
    fn test_run_until_shutdown() {
        let rig = SimulatedRig::new(&[0]);
        let (mut engine, _) = engine_with(&rig, test_config());
        let (sender, mut receiver) = shutdown::channel();

        sender.send("test");
        engine.run(&mut receiver).expect("clean shutdown");
        assert_eq!(engine.state(), State::Stopped);
        assert!(engine.device().window.is_empty());
        assert_eq!(engine.step().expect("step"), State::Stopped);
    }

    /// Work source that requests shutdown once it has handed out all of its work
    struct StoppingSource {
        remaining: u32,
        issued: u32,
        shutdown: shutdown::Sender,
    }

    impl WorkSource for StoppingSource {
        fn next_work(&mut self) -> Option<Work> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            if self.remaining == 0 {
                self.shutdown.send("work exhausted");
            }
            let work = NullWork::prepare(self.issued);
            self.issued += 1;
            Some(work)
        }
    }

    #[test]
    fn test_run_stops_with_work_in_flight() {
        let rig = SimulatedRig::new(&[0]);
        let (sender, mut receiver) = shutdown::channel();
        let source = StoppingSource {
            remaining: 3,
            issued: 0,
            shutdown: sender,
        };
        let sink = SolutionLog::new();
        let mut engine = Engine::new(
            test_config(),
            Bus::new(rig.transport()),
            source,
            sink.clone(),
        )
        .expect("valid config");
        let cell = engine.snapshot_cell();

        // first job gets a solution, the other two stay in flight
        rig.queue_nonce(0, 0, 5, 0x1234_5678);
        engine.run(&mut receiver).expect("clean shutdown");

        assert_eq!(engine.state(), State::Stopped);
        assert_eq!(rig.jobs(0), vec![0, 1, 2]);
        assert_eq!(sink.len(), 1);
        assert!(engine.device().window.is_empty());
        assert_eq!(engine.step().expect("step"), State::Stopped);

        let snapshot = cell.get().expect("published on stop");
        assert_eq!(snapshot.work_in_flight, 0);
        assert_eq!(snapshot.boards[0].jobs, 3);
        assert_eq!(snapshot.accepted, 1);
    }

    #[test]
    fn test_nonce_answer_layout() {
        let answer = test_utils::nonce_answer(1, 2, 3);
        assert_eq!(answer.len(), 1 + protocol::NONCE_FOUND_SIZE);
        assert_eq!(answer[0], Status::NonceFound as u8);
    }
}
