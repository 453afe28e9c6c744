//! CV programming correlator
//!
//! The central does not echo request identifiers, so requests are serialized:
//! one request is on the wire at a time and the next qualifying result or
//! NACK settles it. The timeout clock starts when a request is sent, not when
//! it is queued.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{ProgrammingError, RequestId, SessionId};
use crate::protocol::{LanCommand, LanEvent};

use super::timer::{TimerHandle, TimerKind, Timers};

#[derive(Debug, Clone)]
struct PendingProgrammingRequest {
    id: RequestId,
    session: SessionId,
    client_request_id: Value,
    cv: u16,
    command: LanCommand,
}

#[derive(Debug)]
struct InFlight {
    request: PendingProgrammingRequest,
    issued_at: Instant,
    timer: TimerHandle,
    /// Owner went away; the outcome is not delivered but still occupies the line
    orphaned: bool,
}

/// Final outcome of a programming request, addressed to its session
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub session: SessionId,
    pub client_request_id: Value,
    pub cv: u16,
    pub outcome: Result<u8, ProgrammingError>,
}

/// What a correlator step produced
#[derive(Debug, Default, PartialEq)]
pub struct Progress {
    /// Outcome to deliver, if the request was settled and its owner is still around
    pub settled: Option<Settlement>,
    /// Next queued request to put on the wire
    pub next: Option<LanCommand>,
}

#[derive(Debug)]
pub struct ProgrammingCorrelator {
    timeout: Duration,
    next_id: u64,
    queue: VecDeque<PendingProgrammingRequest>,
    in_flight: Option<InFlight>,
}

impl ProgrammingCorrelator {
    pub fn new(timeout: Duration) -> Self {
        ProgrammingCorrelator {
            timeout,
            next_id: 1,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Queues a request; returns its command if the line was idle
    pub fn submit<T: Timers>(
        &mut self,
        timers: &mut T,
        session: SessionId,
        client_request_id: Value,
        cv: u16,
        command: LanCommand,
    ) -> (RequestId, Option<LanCommand>) {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.queue.push_back(PendingProgrammingRequest {
            id,
            session,
            client_request_id,
            cv,
            command,
        });
        debug!(request = %id, %session, cv, queued = self.queue.len(), "Programming request queued");
        (id, self.dispatch_next(timers))
    }

    fn dispatch_next<T: Timers>(&mut self, timers: &mut T) -> Option<LanCommand> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.queue.pop_front()?;
        let timer = timers.schedule(self.timeout, TimerKind::ProgrammingTimeout { request: request.id });
        let command = request.command;
        self.in_flight = Some(InFlight {
            request,
            issued_at: Instant::now(),
            timer,
            orphaned: false,
        });
        Some(command)
    }

    /// Settles the in-flight request and moves the line on
    fn settle<T: Timers>(&mut self, timers: &mut T, outcome: Result<u8, ProgrammingError>) -> Progress {
        let Some(in_flight) = self.in_flight.take() else {
            return Progress::default();
        };
        timers.cancel(in_flight.timer);
        debug!(
            request = %in_flight.request.id,
            cv = in_flight.request.cv,
            elapsed_ms = in_flight.issued_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Programming request settled"
        );

        let settled = (!in_flight.orphaned).then(|| Settlement {
            session: in_flight.request.session,
            client_request_id: in_flight.request.client_request_id,
            cv: in_flight.request.cv,
            outcome,
        });
        Progress {
            settled,
            next: self.dispatch_next(timers),
        }
    }

    /// Feeds a decoded event; only CV results and NACKs matter
    pub fn on_event<T: Timers>(&mut self, timers: &mut T, event: &LanEvent) -> Progress {
        let expected = self.in_flight.as_ref().map(|in_flight| in_flight.request.cv);
        match (event, expected) {
            (LanEvent::CvResult { cv, value }, Some(expected)) if *cv == expected => {
                self.settle(timers, Ok(*value))
            }
            (LanEvent::CvResult { cv, .. }, _) => {
                debug!(cv, ?expected, "Ignoring CV result without a matching request");
                Progress::default()
            }
            (LanEvent::CvNack { short_circuit }, Some(_)) => {
                let err = if *short_circuit {
                    ProgrammingError::ShortCircuit
                } else {
                    ProgrammingError::Nack
                };
                self.settle(timers, Err(err))
            }
            (LanEvent::CvNack { .. }, None) => {
                debug!("Ignoring CV NACK without a pending request");
                Progress::default()
            }
            _ => Progress::default(),
        }
    }

    /// Handles a fired timeout timer
    pub fn on_timeout<T: Timers>(&mut self, timers: &mut T, request: RequestId, handle: TimerHandle) -> Progress {
        match &self.in_flight {
            Some(in_flight) if in_flight.request.id == request && in_flight.timer == handle => {
                warn!(request = %request, cv = in_flight.request.cv, "Programming request timed out");
                self.settle(timers, Err(ProgrammingError::Timeout))
            }
            _ => Progress::default(),
        }
    }

    /// Rejects everything a closing session still waits for
    ///
    /// Queued requests are dropped. An in-flight request stays on the wire
    /// until its result or timeout arrives, but its outcome is discarded.
    pub fn close_session(&mut self, session: SessionId) -> Vec<Settlement> {
        let mut rejected = Vec::new();

        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.request.session == session && !in_flight.orphaned {
                in_flight.orphaned = true;
                rejected.push(Settlement {
                    session,
                    client_request_id: in_flight.request.client_request_id.clone(),
                    cv: in_flight.request.cv,
                    outcome: Err(ProgrammingError::SessionClosed),
                });
            }
        }

        let (closed, kept): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|request| request.session == session);
        self.queue = kept;
        rejected.extend(closed.into_iter().map(|request| Settlement {
            session,
            client_request_id: request.client_request_id,
            cv: request.cv,
            outcome: Err(ProgrammingError::SessionClosed),
        }));

        rejected
    }

    /// Requests not yet settled for a session, in flight or queued
    pub fn pending_for(&self, session: SessionId) -> usize {
        let in_flight = self
            .in_flight
            .as_ref()
            .filter(|in_flight| in_flight.request.session == session && !in_flight.orphaned)
            .is_some();
        usize::from(in_flight) + self.queue.iter().filter(|r| r.session == session).count()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight.as_ref().map(|in_flight| in_flight.request.id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
