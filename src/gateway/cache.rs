//! Replay cache
//!
//! Last known state per entity, overwritten by every decoded event
//! (last write wins). Replays are built from ordered maps so every client
//! sees entities in the same order.

use std::collections::BTreeMap;

use crate::core::{CentralState, TurnoutState};
use crate::protocol::{ExtAccessoryInfo, LanEvent, LocoInfo, ServerMessage, SystemState, TrackPowerChange};

/// Merged view of track power from broadcasts, status and system state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackPowerState {
    pub on: bool,
    pub emergency_stop: bool,
    pub programming_mode: bool,
    pub short_circuit: bool,
}

impl TrackPowerState {
    fn from_central(state: CentralState) -> Self {
        TrackPowerState {
            on: !state.track_voltage_off() && !state.short_circuit(),
            emergency_stop: state.emergency_stop(),
            programming_mode: state.programming_mode(),
            short_circuit: state.short_circuit(),
        }
    }

    fn apply(self, change: TrackPowerChange) -> Self {
        match change {
            TrackPowerChange::On => TrackPowerState {
                on: true,
                ..TrackPowerState::default()
            },
            TrackPowerChange::Off => TrackPowerState {
                on: false,
                short_circuit: false,
                programming_mode: false,
                ..self
            },
            TrackPowerChange::ProgrammingMode => TrackPowerState {
                on: true,
                programming_mode: true,
                ..self
            },
            TrackPowerChange::ShortCircuit => TrackPowerState {
                on: false,
                short_circuit: true,
                ..self
            },
        }
    }

    pub fn to_message(self) -> ServerMessage {
        ServerMessage::TrackPower {
            on: self.on,
            short: self.short_circuit,
            emergency_stop: self.emergency_stop,
            programming_mode: self.programming_mode,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplayCache {
    locos: BTreeMap<u16, LocoInfo>,
    turnouts: BTreeMap<u16, TurnoutState>,
    ext_accessories: BTreeMap<u16, ExtAccessoryInfo>,
    track_power: Option<TrackPowerState>,
    system_state: Option<SystemState>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event; returns true when the merged track power changed
    pub fn apply(&mut self, event: &LanEvent) -> bool {
        let power = match event {
            LanEvent::LocoInfo(info) => {
                self.locos.insert(info.addr, *info);
                return false;
            }
            LanEvent::TurnoutInfo(info) => {
                self.turnouts.insert(info.addr, info.state);
                return false;
            }
            LanEvent::ExtAccessoryInfo(info) => {
                self.ext_accessories.insert(info.addr, *info);
                return false;
            }
            LanEvent::TrackPower(change) => self.track_power.unwrap_or_default().apply(*change),
            LanEvent::Stopped => TrackPowerState {
                emergency_stop: true,
                ..self.track_power.unwrap_or_default()
            },
            LanEvent::StatusChanged(state) => TrackPowerState::from_central(*state),
            LanEvent::SystemState(state) => {
                self.system_state = Some(*state);
                TrackPowerState::from_central(state.central_state)
            }
            _ => return false,
        };

        let changed = self.track_power != Some(power);
        self.track_power = Some(power);
        changed
    }

    pub fn track_power(&self) -> Option<TrackPowerState> {
        self.track_power
    }

    pub fn loco(&self, addr: u16) -> Option<&LocoInfo> {
        self.locos.get(&addr)
    }

    pub fn turnout(&self, addr: u16) -> Option<TurnoutState> {
        self.turnouts.get(&addr).copied()
    }

    /// Number of cached entities that produce a replay message
    pub fn len(&self) -> usize {
        self.locos.len()
            + self.turnouts.len()
            + self.ext_accessories.len()
            + usize::from(self.track_power.is_some())
            + usize::from(self.system_state.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One message per cached entity: locos, turnouts, extended accessories,
    /// track power, system state
    pub fn replay(&self) -> Vec<ServerMessage> {
        let mut messages = Vec::with_capacity(self.len());
        messages.extend(self.locos.values().map(ServerMessage::loco));
        messages.extend(
            self.turnouts
                .iter()
                .map(|(addr, state)| ServerMessage::TurnoutState {
                    addr: *addr,
                    state: *state,
                }),
        );
        messages.extend(self.ext_accessories.values().map(ServerMessage::ext_accessory));
        messages.extend(self.track_power.map(TrackPowerState::to_message));
        messages.extend(self.system_state.map(ServerMessage::SystemState));
        messages
    }
}
