// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Stop-and-wait image transfer session.
//!
//! Retries are bounded on two tiers. Within a waiting state, `max_attempts`
//! consecutive unanswered reads make the session fall back to the previous
//! sending state (header, same chunk, or end marker). Falling back resets the
//! count, so those cycles can repeat indefinitely; only the overall deadline
//! limits the total work.

use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use crate::chunk::{Chunk, ChunkScheduler};
use crate::payload::{self, PayloadError, PayloadFormat, TransferRequest};
use crate::protocol::*;
use crate::serial::{DEFAULT_READ_TIMEOUT, Link};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("link error in state {state}: {source}")]
    Link {
        state: SessionState,
        source: std::io::Error,
    },

    #[error("transfer timed out after {elapsed:.2?} in state {state} ({offset} of {total} bytes acknowledged)")]
    TimedOut {
        state: SessionState,
        offset: usize,
        total: usize,
        elapsed: Duration,
    },

    #[error("invalid session configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub chunk_size: usize,
    /// Consecutive unanswered reads before a waiting state escalates
    pub max_attempts: u32,
    pub read_timeout: Duration,
    /// Pause after each escalation
    pub backoff: Duration,
    pub overall_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            read_timeout: DEFAULT_READ_TIMEOUT,
            backoff: Duration::from_millis(100),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.chunk_size == 0 {
            return Err(SessionError::Config("chunk size must be at least 1 byte".into()));
        }
        if self.max_attempts == 0 {
            return Err(SessionError::Config("max attempts must be at least 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// States, Events and Actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    WaitReady,
    SendData,
    WaitAck,
    SendEnd,
    WaitComplete,
    Done,
    /// Only reached through the overall deadline
    TimedOut,
}

impl SessionState {
    /// States that read one control byte from the link
    pub fn is_waiting(self) -> bool {
        matches!(self, SessionState::WaitReady | SessionState::WaitAck | SessionState::WaitComplete)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::TimedOut)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::WaitReady => "WAIT_READY",
            SessionState::SendData => "SEND_DATA",
            SessionState::WaitAck => "WAIT_ACK",
            SessionState::SendEnd => "SEND_END",
            SessionState::WaitComplete => "WAIT_COMPLETE",
            SessionState::Done => "DONE",
            SessionState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Everything the session carries between transitions besides its state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionRecord {
    /// Start of the next unacknowledged chunk
    pub offset: usize,
    /// Consecutive unanswered reads in the current waiting state
    pub attempts: u32,
    /// Escalations so far (header, chunk or end marker sent again)
    pub resends: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A sending state gets to act
    Tick,
    /// Outcome of one bounded read; `None` on timeout
    Received(Option<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    SendHeader,
    SendChunk(Chunk<'a>),
    SendEnd,
    /// Sleep before acting on the fallback state
    Backoff,
    /// Nothing to do; read again
    Wait,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step<'a> {
    pub state: SessionState,
    pub record: SessionRecord,
    pub action: Action<'a>,
}

// ============================================================================
// Transition Function
// ============================================================================

/// Compute the next state, record and the action to perform on the link.
///
/// Pure: all I/O is left to the caller. Any byte other than the one a waiting
/// state expects counts the same as no byte at all.
pub fn transition<'a>(
    state: SessionState,
    record: SessionRecord,
    event: Event,
    scheduler: &ChunkScheduler<'a>,
    max_attempts: u32,
) -> Step<'a> {
    let received = match event {
        Event::Received(byte) => byte,
        Event::Tick => None,
    };

    match state {
        SessionState::Init => Step {
            state: SessionState::WaitReady,
            record: SessionRecord { attempts: 0, ..record },
            action: Action::SendHeader,
        },
        SessionState::WaitReady => {
            if received == Some(READY) {
                // Nothing to send for an empty payload
                let next = if scheduler.is_complete(0) { SessionState::SendEnd } else { SessionState::SendData };
                Step {
                    state: next,
                    record: SessionRecord { offset: 0, attempts: 0, ..record },
                    action: Action::Wait,
                }
            } else {
                unanswered(state, record, max_attempts, SessionState::Init)
            }
        }
        SessionState::SendData => Step {
            state: SessionState::WaitAck,
            record: SessionRecord { attempts: 0, ..record },
            action: Action::SendChunk(scheduler.next(record.offset)),
        },
        SessionState::WaitAck => {
            if received == Some(ACK) {
                let offset = scheduler.advance(record.offset);
                let next = if scheduler.is_complete(offset) { SessionState::SendEnd } else { SessionState::SendData };
                Step {
                    state: next,
                    record: SessionRecord { offset, attempts: 0, ..record },
                    action: Action::Wait,
                }
            } else {
                unanswered(state, record, max_attempts, SessionState::SendData)
            }
        }
        SessionState::SendEnd => Step {
            state: SessionState::WaitComplete,
            record: SessionRecord { attempts: 0, ..record },
            action: Action::SendEnd,
        },
        SessionState::WaitComplete => {
            if received == Some(RECEIVED) {
                Step { state: SessionState::Done, record, action: Action::Finish }
            } else {
                unanswered(state, record, max_attempts, SessionState::SendEnd)
            }
        }
        SessionState::Done | SessionState::TimedOut => Step { state, record, action: Action::Finish },
    }
}

fn unanswered<'a>(
    state: SessionState,
    mut record: SessionRecord,
    max_attempts: u32,
    fallback: SessionState,
) -> Step<'a> {
    record.attempts += 1;
    if record.attempts >= max_attempts {
        record.attempts = 0;
        record.resends += 1;
        Step { state: fallback, record, action: Action::Backoff }
    } else {
        Step { state, record, action: Action::Wait }
    }
}

// ============================================================================
// Session Driver
// ============================================================================

/// Outcome of a successful transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    pub resends: u32,
    pub elapsed: Duration,
}

/// Owns the link for the whole transfer and closes it when dropped
pub struct Session {
    link: Box<dyn Link>,
    request: TransferRequest,
    config: SessionConfig,
    header: Vec<u8>,
    state: SessionState,
    record: SessionRecord,
    started: Instant,
}

impl Session {
    pub fn new(link: Box<dyn Link>, request: TransferRequest, config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Session {
            link,
            header: encode_header(request.len(), request.checksum),
            request,
            config,
            state: SessionState::Init,
            record: SessionRecord::default(),
            started: Instant::now(),
        };
        if let Err(e) = config.validate() {
            session.link.close();
            return Err(e);
        }
        Ok(session)
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn record(&self) -> SessionRecord {
        self.record
    }

    /// Run one iteration: check the deadline, read if waiting, transition,
    /// then carry out the resulting action.
    pub fn step(&mut self) -> Result<SessionState, SessionError> {
        let elapsed = self.started.elapsed();
        if !self.state.is_terminal() && elapsed >= self.config.overall_timeout {
            let state = self.state;
            self.state = SessionState::TimedOut;
            warn!(%state, offset = self.record.offset, "overall deadline exceeded");
            return Err(SessionError::TimedOut {
                state,
                offset: self.record.offset,
                total: self.request.len(),
                elapsed,
            });
        }

        let event = if self.state.is_waiting() {
            let remaining = self.config.overall_timeout.saturating_sub(elapsed);
            Event::Received(self.read_control(remaining.min(self.config.read_timeout))?)
        } else {
            Event::Tick
        };

        let from = self.state;
        let scheduler = ChunkScheduler::new(&self.request.payload, self.config.chunk_size);
        let step = transition(from, self.record, event, &scheduler, self.config.max_attempts);
        let link_error = |source| SessionError::Link { state: from, source };

        match step.action {
            Action::SendHeader => {
                self.link.write_all(&self.header).map_err(link_error)?;
                info!(
                    length = self.request.len(),
                    checksum = self.request.checksum,
                    "sent START header"
                );
            }
            Action::SendChunk(chunk) => {
                self.link.write_all(chunk.bytes).map_err(link_error)?;
                debug!(
                    index = chunk.index,
                    offset = chunk.offset,
                    len = chunk.bytes.len(),
                    "sent chunk {}/{}",
                    chunk.index + 1,
                    scheduler.chunk_count()
                );
            }
            Action::SendEnd => {
                self.link.write_all(&[END]).map_err(link_error)?;
                info!("sent END marker");
            }
            Action::Backoff => {
                match step.state {
                    SessionState::Init => warn!("receiver not responding with READY, resending header"),
                    SessionState::SendData => warn!(offset = step.record.offset, "chunk not acknowledged, resending"),
                    _ => warn!("no completion confirmation, resending END"),
                }
                let remaining = self.config.overall_timeout.saturating_sub(self.started.elapsed());
                std::thread::sleep(self.config.backoff.min(remaining));
            }
            Action::Wait => {}
            Action::Finish => {}
        }

        if step.state != from {
            trace!(%from, to = %step.state, "transition");
        }
        if from == SessionState::WaitAck && step.record.offset != self.record.offset {
            info!(
                acknowledged = step.record.offset.min(self.request.len()),
                total = self.request.len(),
                "chunk acknowledged"
            );
        }
        self.state = step.state;
        self.record = step.record;
        Ok(self.state)
    }

    /// Drive the session to completion or failure
    pub fn run(mut self) -> Result<TransferReport, SessionError> {
        while self.step()? != SessionState::Done {}

        let report = TransferReport {
            bytes: self.request.len(),
            chunks: ChunkScheduler::new(&self.request.payload, self.config.chunk_size).chunk_count(),
            resends: self.record.resends,
            elapsed: self.started.elapsed(),
        };
        info!(
            resends = report.resends,
            "image transfer completed in {:.2} seconds",
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    fn read_control(&mut self, timeout: Duration) -> Result<Option<u8>, SessionError> {
        let mut buf = [0u8; 1];
        let n = self
            .link
            .read(&mut buf, timeout)
            .map_err(|source| SessionError::Link { state: self.state, source })?;
        if n == 0 {
            trace!(state = %self.state, "read timed out");
            return Ok(None);
        }
        debug!(state = %self.state, "received {}", control_name(buf[0]));
        Ok(Some(buf[0]))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.link.close();
    }
}

/// Load the payload at `payload_path` and transfer it over `link`.
///
/// The link is closed on every path out of here, including a payload that
/// cannot be read.
pub fn send(
    mut link: Box<dyn Link>,
    payload_path: &Path,
    format: PayloadFormat,
    config: SessionConfig,
) -> Result<TransferReport, SessionError> {
    let request = match payload::load(payload_path, format) {
        Ok(request) => request,
        Err(e) => {
            link.close();
            return Err(e.into());
        }
    };
    Session::new(link, request, config)?.run()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;
    use crate::serial::{LoopbackLink, MockLink};
    use std::sync::atomic::Ordering;
    use super::SessionState::*;

    fn fast_config(chunk_size: usize) -> SessionConfig {
        SessionConfig {
            chunk_size,
            max_attempts: 3,
            read_timeout: Duration::from_millis(5),
            backoff: Duration::from_millis(1),
            overall_timeout: Duration::from_secs(5),
        }
    }

    /// Feed the pure transition function; wait states consume `replies` in order.
    fn trace_states(payload: &[u8], chunk_size: usize, replies: &[Option<u8>]) -> (Vec<SessionState>, Vec<Vec<u8>>) {
        let scheduler = ChunkScheduler::new(payload, chunk_size);
        let mut replies = replies.iter().copied();
        let mut state = Init;
        let mut record = SessionRecord::default();
        let mut states = vec![state];
        let mut chunks = Vec::new();

        while state != Done {
            let event = if state.is_waiting() {
                Event::Received(replies.next().expect("ran out of replies"))
            } else {
                Event::Tick
            };
            let step = transition(state, record, event, &scheduler, 3);
            if let Action::SendChunk(chunk) = step.action {
                chunks.push(chunk.bytes.to_vec());
            }
            if step.state != state {
                states.push(step.state);
            }
            state = step.state;
            record = step.record;
        }
        (states, chunks)
    }

    fn header_for(payload: &[u8]) -> Vec<u8> {
        encode_header(payload.len(), checksum(payload))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WaitReady.to_string(), "WAIT_READY");
        assert_eq!(TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_transition_aaaa_scenario() {
        let replies = [Some(READY), Some(ACK), Some(ACK), Some(RECEIVED)];
        let (states, chunks) = trace_states(b"AAAA", 2, &replies);

        assert_eq!(
            states,
            vec![Init, WaitReady, SendData, WaitAck, SendData, WaitAck, SendEnd, WaitComplete, Done]
        );
        assert_eq!(chunks, vec![b"AA".to_vec(), b"AA".to_vec()]);
    }

    #[test]
    fn test_transition_wait_ready_falls_back_to_init() {
        let scheduler = ChunkScheduler::new(b"AAAA", 2);
        let mut record = SessionRecord::default();

        for expected_attempts in 1..3 {
            let step = transition(WaitReady, record, Event::Received(None), &scheduler, 3);
            assert_eq!(step.state, WaitReady);
            assert_eq!(step.action, Action::Wait);
            assert_eq!(step.record.attempts, expected_attempts);
            record = step.record;
        }

        // A stray byte is no better than silence
        let step = transition(WaitReady, record, Event::Received(Some(b'?')), &scheduler, 3);
        assert_eq!(step.state, Init);
        assert_eq!(step.action, Action::Backoff);
        assert_eq!(step.record.resends, 1);

        let step = transition(Init, step.record, Event::Tick, &scheduler, 3);
        assert_eq!(step.state, WaitReady);
        assert_eq!(step.action, Action::SendHeader);
        assert_eq!(step.record.attempts, 0);
    }

    #[test]
    fn test_transition_resends_same_chunk() {
        let payload = b"AABB";
        let mut replies = vec![Some(READY)];
        // First chunk goes unanswered for two full rounds
        replies.extend([None, None, None, None, Some(RECEIVED), None]);
        replies.extend([Some(ACK), Some(ACK), Some(RECEIVED)]);

        let (_, chunks) = trace_states(payload, 2, &replies);
        assert_eq!(
            chunks,
            vec![b"AA".to_vec(), b"AA".to_vec(), b"AA".to_vec(), b"BB".to_vec()]
        );
    }

    #[test]
    fn test_transition_wait_complete_resends_end() {
        let scheduler = ChunkScheduler::new(b"AAAA", 2);
        let mut record = SessionRecord { offset: 4, ..Default::default() };
        let mut state = WaitComplete;
        for _ in 0..3 {
            let step = transition(state, record, Event::Received(Some(ACK)), &scheduler, 3);
            state = step.state;
            record = step.record;
        }
        assert_eq!(state, SendEnd);

        let step = transition(state, record, Event::Tick, &scheduler, 3);
        assert_eq!(step.state, WaitComplete);
        assert_eq!(step.action, Action::SendEnd);
    }

    #[test]
    fn test_transition_empty_payload_skips_data() {
        let (states, chunks) = trace_states(b"", 16, &[Some(READY), Some(RECEIVED)]);
        assert_eq!(states, vec![Init, WaitReady, SendEnd, WaitComplete, Done]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_transition_terminal_states_absorb() {
        let scheduler = ChunkScheduler::new(b"AAAA", 2);
        let record = SessionRecord { offset: 4, attempts: 0, resends: 2 };
        for state in [Done, TimedOut] {
            let step = transition(state, record, Event::Received(Some(READY)), &scheduler, 3);
            assert_eq!(step.state, state);
            assert_eq!(step.record, record);
            assert_eq!(step.action, Action::Finish);
        }
    }

    #[test]
    fn test_session_aaaa_transfer() {
        let payload = b"AAAA".to_vec();
        let responses = vec![Some(READY), Some(ACK), Some(ACK), Some(RECEIVED)];

        let mut expected_writes = b"\x014,4".to_vec();
        expected_writes.extend_from_slice(b"AA");
        expected_writes.extend_from_slice(b"AA");
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let closed = link.closed_flag();
        let request = TransferRequest::new(payload, 4);

        let report = Session::new(Box::new(link), request, fast_config(2)).unwrap().run().unwrap();
        assert_eq!(report.bytes, 4);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.resends, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_session_round_trip_count() {
        let payload: Vec<u8> = (0..25u8).collect();
        let chunk_size = 10;

        let mut responses = vec![Some(READY)];
        responses.extend(std::iter::repeat_n(Some(ACK), payload.len().div_ceil(chunk_size)));
        responses.push(Some(RECEIVED));

        let mut expected_writes = header_for(&payload);
        expected_writes.extend_from_slice(&payload);
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let request = TransferRequest::new(payload, 25);
        let report = Session::new(Box::new(link), request, fast_config(chunk_size)).unwrap().run().unwrap();
        assert_eq!(report.chunks, 3);
    }

    #[test]
    fn test_session_header_retry() {
        let payload = b"AAAA".to_vec();
        let responses = vec![None, None, Some(b'x'), Some(READY), Some(ACK), Some(RECEIVED)];

        let mut expected_writes = header_for(&payload);
        expected_writes.extend(header_for(&payload));
        expected_writes.extend_from_slice(b"AAAA");
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let request = TransferRequest::new(payload, 4);
        let report = Session::new(Box::new(link), request, fast_config(DEFAULT_CHUNK_SIZE)).unwrap().run().unwrap();
        assert_eq!(report.resends, 1);
    }

    #[test]
    fn test_session_resends_unacknowledged_chunk() {
        let payload = b"AABB".to_vec();
        let mut responses = vec![Some(READY)];
        responses.extend([None, None, None]);
        responses.extend([None, None, None]);
        responses.extend([Some(ACK), Some(ACK), Some(RECEIVED)]);

        let mut expected_writes = header_for(&payload);
        expected_writes.extend_from_slice(b"AA");
        expected_writes.extend_from_slice(b"AA");
        expected_writes.extend_from_slice(b"AA");
        expected_writes.extend_from_slice(b"BB");
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let request = TransferRequest::new(payload, 4);
        let report = Session::new(Box::new(link), request, fast_config(2)).unwrap().run().unwrap();
        assert_eq!(report.resends, 2);
    }

    #[test]
    fn test_session_resends_end_marker() {
        let payload = b"AAAA".to_vec();
        let responses = vec![Some(READY), Some(ACK), None, None, None, Some(RECEIVED)];

        let mut expected_writes = header_for(&payload);
        expected_writes.extend_from_slice(b"AAAA");
        expected_writes.push(END);
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let request = TransferRequest::new(payload, 4);
        Session::new(Box::new(link), request, fast_config(16)).unwrap().run().unwrap();
    }

    #[test]
    fn test_session_silent_receiver_times_out() {
        let link = MockLink::silent();
        let closed = link.closed_flag();
        let config = SessionConfig {
            overall_timeout: Duration::from_millis(100),
            ..fast_config(2)
        };

        let started = Instant::now();
        let result = Session::new(Box::new(link), TransferRequest::new(b"AAAA".to_vec(), 4), config)
            .unwrap()
            .run();

        assert!(started.elapsed() < Duration::from_secs(2));
        match result {
            Err(SessionError::TimedOut { state, offset, total, elapsed }) => {
                assert!(matches!(state, Init | WaitReady), "timed out in {}", state);
                assert_eq!(offset, 0);
                assert_eq!(total, 4);
                assert!(elapsed >= Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_session_step_reports_states() {
        let responses = vec![Some(READY)];
        let expected_writes = header_for(b"AAAA");
        let link = MockLink::new(responses, expected_writes);

        let mut session = Session::new(Box::new(link), TransferRequest::new(b"AAAA".to_vec(), 4), fast_config(2)).unwrap();
        assert_eq!(session.state(), Init);
        assert_eq!(session.step().unwrap(), WaitReady);
        assert_eq!(session.step().unwrap(), SendData);
        assert_eq!(session.record().offset, 0);
    }

    #[test]
    fn test_session_loopback_with_receiver() {
        let payload: Vec<u8> = (0..crate::payload::PACKED_LEN).map(|i| (i * 31 % 256) as u8).collect();
        let link = LoopbackLink::new(Receiver::new(1000));
        let closed = link.closed_flag();
        let slot = link.receiver_slot();

        let request = TransferRequest::new(payload.clone(), crate::payload::PACKED_LEN);
        let report = Session::new(Box::new(link), request, fast_config(1000)).unwrap().run().unwrap();

        assert_eq!(report.chunks, 8);
        assert_eq!(report.resends, 0);
        assert!(closed.load(Ordering::SeqCst));

        let receiver = slot.lock().unwrap().take().expect("receiver state captured on close");
        assert!(receiver.is_complete());
        assert_eq!(receiver.payload(), payload.as_slice());
    }

    #[test]
    fn test_session_loopback_lost_confirmation() {
        // Replies are READY, ACK, RECEIVED; lose the RECEIVED
        let link = LoopbackLink::new(Receiver::new(16)).dropping_response(2);
        let slot = link.receiver_slot();
        let request = TransferRequest::new(b"hello receiver".to_vec(), 14);

        let report = Session::new(Box::new(link), request, fast_config(16)).unwrap().run().unwrap();
        assert_eq!(report.resends, 1);
        assert!(slot.lock().unwrap().as_ref().is_some_and(|r| r.is_complete()));
    }

    #[test]
    fn test_session_loopback_lost_ready() {
        // READY is lost; the header resend must restart the receiver
        let link = LoopbackLink::new(Receiver::new(16)).dropping_response(0);
        let slot = link.receiver_slot();
        let request = TransferRequest::new(b"AAAA".to_vec(), 4);

        let report = Session::new(Box::new(link), request, fast_config(16)).unwrap().run().unwrap();
        assert_eq!(report.resends, 1);

        let receiver = slot.lock().unwrap().take().expect("receiver state captured on close");
        assert!(receiver.is_complete());
        assert_eq!(receiver.payload(), b"AAAA");
    }

    #[test]
    fn test_session_write_failure_reports_state() {
        let responses = vec![Some(READY)];
        let expected_writes = header_for(b"AAAA");
        let link = MockLink::new(responses, expected_writes).failing_write(1);
        let closed = link.closed_flag();

        let result = Session::new(Box::new(link), TransferRequest::new(b"AAAA".to_vec(), 4), fast_config(2))
            .unwrap()
            .run();
        match result {
            Err(SessionError::Link { state, source }) => {
                assert_eq!(state, SendData);
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected link error, got {:?}", other),
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_session_header_write_failure() {
        let link = MockLink::new(Vec::new(), Vec::new()).failing_write(0);
        let result = Session::new(Box::new(link), TransferRequest::new(b"AAAA".to_vec(), 4), fast_config(2))
            .unwrap()
            .run();
        assert!(matches!(result, Err(SessionError::Link { state: Init, .. })));
    }

    #[test]
    fn test_send_missing_payload_closes_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = MockLink::new(Vec::new(), Vec::new());
        let closed = link.closed_flag();

        let result = send(Box::new(link), &dir.path().join("nope.txt"), PayloadFormat::Auto, fast_config(2));
        assert!(matches!(result, Err(SessionError::Payload(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_send_from_file() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"AAAA\n").unwrap();

        let responses = vec![Some(READY), Some(ACK), Some(ACK), Some(RECEIVED)];
        let mut expected_writes = b"\x014,4".to_vec();
        expected_writes.extend_from_slice(b"AAAA");
        expected_writes.push(END);

        let link = MockLink::new(responses, expected_writes);
        let report = send(Box::new(link), file.path(), PayloadFormat::Auto, fast_config(2)).unwrap();
        assert_eq!(report.bytes, 4);
    }

    #[test]
    fn test_invalid_config_closes_link() {
        let link = MockLink::new(Vec::new(), Vec::new());
        let closed = link.closed_flag();

        let result = Session::new(Box::new(link), TransferRequest::new(b"AAAA".to_vec(), 4), fast_config(0));
        assert!(matches!(result, Err(SessionError::Config(_))));
        assert!(closed.load(Ordering::SeqCst));
    }
}
