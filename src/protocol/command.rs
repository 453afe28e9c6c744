use crate::core::{BroadcastFlags, Direction, FunctionMap, LocoAddress, SpeedSteps, TurnoutState};

use super::registry::{Command, FunctionGroup};

/// What a single-function command does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionAction {
    Off,
    On,
    Toggle,
}

/// A command to the central with its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanCommand {
    GetSerialNumber,
    GetHardwareInfo,
    Logoff,
    SetBroadcastFlags(BroadcastFlags),
    GetBroadcastFlags,
    GetSystemState,
    GetVersion,
    GetStatus,
    SetTrackPower {
        on: bool,
    },
    /// Direct mode read on the programming track; CVs are 1-based
    CvRead {
        cv: u16,
    },
    CvWrite {
        cv: u16,
        value: u8,
    },
    GetTurnoutInfo {
        addr: u16,
    },
    SetTurnout {
        addr: u16,
        /// `Straight` drives output 1, anything else output 2
        output: TurnoutState,
        activate: bool,
        queue: bool,
    },
    GetExtAccessoryInfo {
        addr: u16,
    },
    SetExtAccessory {
        addr: u16,
        value: u8,
    },
    /// Emergency stop of every locomotive
    SetStop,
    LocoEStop {
        addr: LocoAddress,
    },
    GetLocoInfo {
        addr: LocoAddress,
    },
    LocoDrive {
        addr: LocoAddress,
        steps: SpeedSteps,
        direction: Direction,
        speed: u8,
        emergency_stop: bool,
    },
    LocoFunction {
        addr: LocoAddress,
        function: u8,
        action: FunctionAction,
    },
    LocoFunctionGroup {
        addr: LocoAddress,
        group: FunctionGroup,
        functions: FunctionMap,
    },
    PomWriteByte {
        addr: LocoAddress,
        cv: u16,
        value: u8,
    },
    PomReadByte {
        addr: LocoAddress,
        cv: u16,
    },
    GetFirmwareVersion,
}

impl LanCommand {
    /// Registry entry this command is encoded with
    pub fn command(&self) -> Command {
        match self {
            LanCommand::GetSerialNumber => Command::GetSerialNumber,
            LanCommand::GetHardwareInfo => Command::GetHardwareInfo,
            LanCommand::Logoff => Command::Logoff,
            LanCommand::SetBroadcastFlags(_) => Command::SetBroadcastFlags,
            LanCommand::GetBroadcastFlags => Command::GetBroadcastFlags,
            LanCommand::GetSystemState => Command::GetSystemState,
            LanCommand::GetVersion => Command::GetVersion,
            LanCommand::GetStatus => Command::GetStatus,
            LanCommand::SetTrackPower { on: false } => Command::SetTrackPowerOff,
            LanCommand::SetTrackPower { on: true } => Command::SetTrackPowerOn,
            LanCommand::CvRead { .. } => Command::CvRead,
            LanCommand::CvWrite { .. } => Command::CvWrite,
            LanCommand::GetTurnoutInfo { .. } => Command::GetTurnoutInfo,
            LanCommand::SetTurnout { .. } => Command::SetTurnout,
            LanCommand::GetExtAccessoryInfo { .. } => Command::GetExtAccessoryInfo,
            LanCommand::SetExtAccessory { .. } => Command::SetExtAccessory,
            LanCommand::SetStop => Command::SetStop,
            LanCommand::LocoEStop { .. } => Command::SetLocoEStop,
            LanCommand::GetLocoInfo { .. } => Command::GetLocoInfo,
            LanCommand::LocoDrive { steps, .. } => match steps {
                SpeedSteps::Steps14 => Command::SetLocoDrive14,
                SpeedSteps::Steps28 => Command::SetLocoDrive28,
                SpeedSteps::Steps128 => Command::SetLocoDrive128,
            },
            LanCommand::LocoFunction { .. } => Command::SetLocoFunction,
            LanCommand::LocoFunctionGroup { group, .. } => Command::SetLocoFunctionGroup(*group),
            LanCommand::PomWriteByte { .. } => Command::CvPomWriteByte,
            LanCommand::PomReadByte { .. } => Command::CvPomReadByte,
            LanCommand::GetFirmwareVersion => Command::GetFirmwareVersion,
        }
    }
}
