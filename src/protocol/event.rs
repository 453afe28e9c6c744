use bytes::Bytes;
use serde::Serialize;

use crate::core::{CentralState, CentralStateEx, Direction, FunctionMap, SpeedSteps, TurnoutState};

/// Full state report of one locomotive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocoInfo {
    pub addr: u16,
    /// Another controller currently drives this locomotive
    pub busy: bool,
    pub steps: SpeedSteps,
    pub direction: Direction,
    /// Physical speed, 0 when stopped or emergency stopped
    pub speed: u8,
    pub emergency_stop: bool,
    pub double_traction: bool,
    pub smart_search: bool,
    pub functions: FunctionMap,
}

/// Position report of a turnout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnoutInfo {
    pub addr: u16,
    pub state: TurnoutState,
}

/// Report of an extended (multi-aspect) accessory decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAccessoryInfo {
    pub addr: u16,
    pub value: u8,
    /// False when the central has never seen this accessory switched
    pub valid: bool,
}

/// Track power broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPowerChange {
    Off,
    On,
    ProgrammingMode,
    ShortCircuit,
}

/// Snapshot of currents, voltages and state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    /// Main track current in mA
    pub main_current: i16,
    /// Programming track current in mA
    pub prog_current: i16,
    pub filtered_main_current: i16,
    /// Internal temperature in °C
    pub temperature: i16,
    /// Supply voltage in mV
    pub supply_voltage: u16,
    /// Track voltage in mV
    pub vcc_voltage: u16,
    pub central_state: CentralState,
    pub central_state_ex: CentralStateEx,
    pub capabilities: u8,
}

/// Decoded notification from the central
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanEvent {
    LocoInfo(LocoInfo),
    TurnoutInfo(TurnoutInfo),
    ExtAccessoryInfo(ExtAccessoryInfo),
    TrackPower(TrackPowerChange),
    /// All locomotives emergency stopped
    Stopped,
    StatusChanged(CentralState),
    SystemState(SystemState),
    Version {
        /// X-Bus version, BCD
        xbus_version: u8,
        command_station_id: u8,
    },
    FirmwareVersion {
        major: u8,
        minor: u8,
    },
    CvResult {
        cv: u16,
        value: u8,
    },
    CvNack {
        short_circuit: bool,
    },
    /// The central rejected a command it did not understand
    UnknownCommand,
    SerialNumber(u32),
    HardwareInfo {
        hw_type: u32,
        /// Firmware version, BCD
        firmware: u32,
    },
    BroadcastFlags(u32),
    /// A well-formed frame the registry does not know
    Unknown {
        family: u16,
        header: Option<u8>,
    },
}

impl LanEvent {
    /// Stable event name, `<domain>.event.<name>`
    pub fn kind(&self) -> &'static str {
        match self {
            LanEvent::LocoInfo(_) => "loco.event.info",
            LanEvent::TurnoutInfo(_) => "switching.event.turnout",
            LanEvent::ExtAccessoryInfo(_) => "switching.event.extaccessory",
            LanEvent::TrackPower(_) => "system.event.trackpower",
            LanEvent::Stopped => "system.event.stopped",
            LanEvent::StatusChanged(_) => "system.event.status",
            LanEvent::SystemState(_) => "system.event.systemstate",
            LanEvent::Version { .. } => "system.event.version",
            LanEvent::FirmwareVersion { .. } => "system.event.firmware",
            LanEvent::CvResult { .. } => "programming.event.cv.result",
            LanEvent::CvNack { .. } => "programming.event.cv.nack",
            LanEvent::UnknownCommand => "system.event.unknownCommand",
            LanEvent::SerialNumber(_) => "system.event.serial",
            LanEvent::HardwareInfo { .. } => "system.event.hwinfo",
            LanEvent::BroadcastFlags(_) => "system.event.broadcastflags",
            LanEvent::Unknown { .. } => "system.event.unknown",
        }
    }
}

/// A decoded datagram together with its raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub event: LanEvent,
    pub raw: Bytes,
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}
