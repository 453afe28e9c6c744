//! Two-phase turnout actuation
//!
//! A set sends the activate frame at once and arms a timer for the pulse
//! length; the deactivate frame goes out when the timer fires. A newer set
//! for the same address cancels the older timer, so only the latest pulse is
//! ever closed.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::core::{Error, Result, TurnoutState, MAX_TURNOUT_PULSE};
use crate::protocol::LanCommand;

use super::timer::{TimerHandle, TimerKind, Timers};

#[derive(Debug, Clone, Copy)]
struct PendingActuation {
    output: TurnoutState,
    timer: TimerHandle,
}

#[derive(Debug)]
pub struct TurnoutScheduler {
    pending: HashMap<u16, PendingActuation>,
    default_pulse: Duration,
}

impl TurnoutScheduler {
    pub fn new(default_pulse: Duration) -> Self {
        TurnoutScheduler {
            pending: HashMap::new(),
            default_pulse,
        }
    }

    /// Starts an actuation and returns the activate command to send
    pub fn set<T: Timers>(
        &mut self,
        timers: &mut T,
        addr: u16,
        output: TurnoutState,
        pulse: Option<Duration>,
    ) -> Result<LanCommand> {
        if !matches!(output, TurnoutState::Straight | TurnoutState::Diverging) {
            return Err(Error::protocol(format!(
                "turnout {} can only be set STRAIGHT or DIVERGING",
                addr
            )));
        }

        let pulse = pulse.unwrap_or(self.default_pulse);
        if pulse > MAX_TURNOUT_PULSE {
            return Err(Error::protocol(format!(
                "turnout pulse of {} ms exceeds {} ms",
                pulse.as_millis(),
                MAX_TURNOUT_PULSE.as_millis()
            )));
        }

        if let Some(previous) = self.pending.remove(&addr) {
            timers.cancel(previous.timer);
            debug!(addr, superseded = ?previous.output, "Superseded pending turnout pulse");
        }

        let timer = timers.schedule(pulse, TimerKind::TurnoutPulse { addr });
        self.pending.insert(addr, PendingActuation { output, timer });

        Ok(LanCommand::SetTurnout {
            addr,
            output,
            activate: true,
            queue: true,
        })
    }

    /// Handles a fired pulse timer; returns the deactivate command unless the
    /// timer was superseded
    pub fn expire(&mut self, addr: u16, handle: TimerHandle) -> Option<LanCommand> {
        match self.pending.get(&addr) {
            Some(pending) if pending.timer == handle => {
                let pending = self.pending.remove(&addr)?;
                Some(deactivate(addr, pending.output))
            }
            _ => {
                debug!(addr, "Ignoring stale turnout timer");
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Cancels every timer and returns the deactivate commands still owed
    pub fn drain<T: Timers>(&mut self, timers: &mut T) -> Vec<LanCommand> {
        let mut commands: Vec<_> = self
            .pending
            .drain()
            .map(|(addr, pending)| {
                timers.cancel(pending.timer);
                deactivate(addr, pending.output)
            })
            .collect();
        commands.sort_by_key(|command| match command {
            LanCommand::SetTurnout { addr, .. } => *addr,
            _ => 0,
        });
        commands
    }
}

fn deactivate(addr: u16, output: TurnoutState) -> LanCommand {
    LanCommand::SetTurnout {
        addr,
        output,
        activate: false,
        queue: true,
    }
}
