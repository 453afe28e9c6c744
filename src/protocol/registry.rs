//! Command registry
//!
//! Static table of every LAN command the gateway sends or understands. The
//! encoder takes header bytes from [`Command::descriptor`] and the decoder
//! dispatches through [`Registry::lookup`], which is built from the same
//! table, so both directions share one source of truth.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

/// Serial number request/response family
pub const FAMILY_SERIAL_NUMBER: u16 = 0x10;
/// Hardware info request/response family
pub const FAMILY_HWINFO: u16 = 0x1A;
/// Logoff family
pub const FAMILY_LOGOFF: u16 = 0x30;
/// X-Bus tunnel family
pub const FAMILY_X: u16 = 0x40;
/// Set broadcast flags family
pub const FAMILY_SET_BROADCASTFLAGS: u16 = 0x50;
/// Get broadcast flags request/response family
pub const FAMILY_GET_BROADCASTFLAGS: u16 = 0x51;
/// System state broadcast family
pub const FAMILY_SYSTEMSTATE_DATACHANGED: u16 = 0x84;
/// System state poll family
pub const FAMILY_SYSTEMSTATE_GETDATA: u16 = 0x85;

/// Bits of the POM option byte that select the operation; the rest carry CV bits
pub const POM_OPTION_MASK: u8 = 0xFC;

/// Which way a command travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Gateway to central
    Outbound,
    /// Central to gateway
    Inbound,
}

/// Header bytes identifying a command on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Frame family (bytes 2..4 of every frame)
    pub family: u16,
    /// X-Bus header, X family only
    pub header: Option<u8>,
    /// Sub-command byte following the header
    pub sub_command: Option<u8>,
    /// Option byte following the address (POM)
    pub option: Option<u8>,
}

impl CommandDescriptor {
    const fn flat(family: u16) -> Self {
        CommandDescriptor {
            family,
            header: None,
            sub_command: None,
            option: None,
        }
    }

    const fn x(header: u8, sub_command: Option<u8>) -> Self {
        CommandDescriptor {
            family: FAMILY_X,
            header: Some(header),
            sub_command,
            option: None,
        }
    }

    const fn pom(option: u8) -> Self {
        CommandDescriptor {
            family: FAMILY_X,
            header: Some(0xE6),
            sub_command: Some(0x30),
            option: Some(option),
        }
    }
}

/// Function groups addressable with one function group frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionGroup {
    F0ToF4,
    F5ToF8,
    F9ToF12,
    F13ToF20,
    F21ToF28,
    F29ToF31,
}

impl FunctionGroup {
    pub const ALL: [FunctionGroup; 6] = [
        FunctionGroup::F0ToF4,
        FunctionGroup::F5ToF8,
        FunctionGroup::F9ToF12,
        FunctionGroup::F13ToF20,
        FunctionGroup::F21ToF28,
        FunctionGroup::F29ToF31,
    ];

    /// Group by its 1-based number as used by clients
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index).checked_sub(1)?).copied()
    }

    /// Sub-command byte selecting the group
    pub const fn sub_command(self) -> u8 {
        match self {
            FunctionGroup::F0ToF4 => 0x20,
            FunctionGroup::F5ToF8 => 0x21,
            FunctionGroup::F9ToF12 => 0x22,
            FunctionGroup::F13ToF20 => 0x23,
            FunctionGroup::F21ToF28 => 0x28,
            FunctionGroup::F29ToF31 => 0x29,
        }
    }

    /// Functions covered by the group
    pub fn functions(self) -> RangeInclusive<u8> {
        match self {
            FunctionGroup::F0ToF4 => 0..=4,
            FunctionGroup::F5ToF8 => 5..=8,
            FunctionGroup::F9ToF12 => 9..=12,
            FunctionGroup::F13ToF20 => 13..=20,
            FunctionGroup::F21ToF28 => 21..=28,
            FunctionGroup::F29ToF31 => 29..=31,
        }
    }
}

/// Named LAN commands, in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Gateway to central
    GetSerialNumber,
    GetHardwareInfo,
    Logoff,
    SetBroadcastFlags,
    GetBroadcastFlags,
    GetSystemState,
    GetVersion,
    GetStatus,
    SetTrackPowerOff,
    SetTrackPowerOn,
    CvRead,
    CvWrite,
    GetTurnoutInfo,
    SetTurnout,
    GetExtAccessoryInfo,
    SetExtAccessory,
    SetStop,
    SetLocoEStop,
    GetLocoInfo,
    SetLocoDrive14,
    SetLocoDrive28,
    SetLocoDrive128,
    SetLocoFunction,
    SetLocoFunctionGroup(FunctionGroup),
    CvPomWriteByte,
    CvPomReadByte,
    GetFirmwareVersion,

    // Central to gateway
    SerialNumber,
    HardwareInfo,
    BroadcastFlags,
    SystemStateDataChanged,
    BcTrackPowerOff,
    BcTrackPowerOn,
    BcProgrammingMode,
    BcTrackShortCircuit,
    CvNackShortCircuit,
    CvNack,
    UnknownCommand,
    StatusChanged,
    VersionInfo,
    CvResult,
    BcStopped,
    LocoInfo,
    TurnoutInfo,
    ExtAccessoryInfo,
    FirmwareVersion,
}

impl Command {
    /// Every registered command
    pub const ALL: [Command; 51] = [
        Command::GetSerialNumber,
        Command::GetHardwareInfo,
        Command::Logoff,
        Command::SetBroadcastFlags,
        Command::GetBroadcastFlags,
        Command::GetSystemState,
        Command::GetVersion,
        Command::GetStatus,
        Command::SetTrackPowerOff,
        Command::SetTrackPowerOn,
        Command::CvRead,
        Command::CvWrite,
        Command::GetTurnoutInfo,
        Command::SetTurnout,
        Command::GetExtAccessoryInfo,
        Command::SetExtAccessory,
        Command::SetStop,
        Command::SetLocoEStop,
        Command::GetLocoInfo,
        Command::SetLocoDrive14,
        Command::SetLocoDrive28,
        Command::SetLocoDrive128,
        Command::SetLocoFunction,
        Command::SetLocoFunctionGroup(FunctionGroup::F0ToF4),
        Command::SetLocoFunctionGroup(FunctionGroup::F5ToF8),
        Command::SetLocoFunctionGroup(FunctionGroup::F9ToF12),
        Command::SetLocoFunctionGroup(FunctionGroup::F13ToF20),
        Command::SetLocoFunctionGroup(FunctionGroup::F21ToF28),
        Command::SetLocoFunctionGroup(FunctionGroup::F29ToF31),
        Command::CvPomWriteByte,
        Command::CvPomReadByte,
        Command::GetFirmwareVersion,
        Command::SerialNumber,
        Command::HardwareInfo,
        Command::BroadcastFlags,
        Command::SystemStateDataChanged,
        Command::BcTrackPowerOff,
        Command::BcTrackPowerOn,
        Command::BcProgrammingMode,
        Command::BcTrackShortCircuit,
        Command::CvNackShortCircuit,
        Command::CvNack,
        Command::UnknownCommand,
        Command::StatusChanged,
        Command::VersionInfo,
        Command::CvResult,
        Command::BcStopped,
        Command::LocoInfo,
        Command::TurnoutInfo,
        Command::ExtAccessoryInfo,
        Command::FirmwareVersion,
    ];

    /// Wire identity of the command
    pub const fn descriptor(self) -> CommandDescriptor {
        use CommandDescriptor as D;

        match self {
            Command::GetSerialNumber | Command::SerialNumber => D::flat(FAMILY_SERIAL_NUMBER),
            Command::GetHardwareInfo | Command::HardwareInfo => D::flat(FAMILY_HWINFO),
            Command::Logoff => D::flat(FAMILY_LOGOFF),
            Command::SetBroadcastFlags => D::flat(FAMILY_SET_BROADCASTFLAGS),
            Command::GetBroadcastFlags | Command::BroadcastFlags => D::flat(FAMILY_GET_BROADCASTFLAGS),
            Command::GetSystemState => D::flat(FAMILY_SYSTEMSTATE_GETDATA),
            Command::SystemStateDataChanged => D::flat(FAMILY_SYSTEMSTATE_DATACHANGED),

            Command::GetVersion => D::x(0x21, Some(0x21)),
            Command::GetStatus => D::x(0x21, Some(0x24)),
            Command::SetTrackPowerOff => D::x(0x21, Some(0x80)),
            Command::SetTrackPowerOn => D::x(0x21, Some(0x81)),
            Command::CvRead => D::x(0x23, Some(0x11)),
            Command::CvWrite => D::x(0x24, Some(0x12)),
            Command::GetTurnoutInfo | Command::TurnoutInfo => D::x(0x43, None),
            Command::SetTurnout => D::x(0x53, None),
            Command::GetExtAccessoryInfo | Command::ExtAccessoryInfo => D::x(0x44, None),
            Command::SetExtAccessory => D::x(0x54, None),
            Command::SetStop => D::x(0x80, None),
            Command::SetLocoEStop => D::x(0x92, None),
            Command::GetLocoInfo => D::x(0xE3, Some(0xF0)),
            Command::SetLocoDrive14 => D::x(0xE4, Some(0x10)),
            Command::SetLocoDrive28 => D::x(0xE4, Some(0x12)),
            Command::SetLocoDrive128 => D::x(0xE4, Some(0x13)),
            Command::SetLocoFunction => D::x(0xE4, Some(0xF8)),
            Command::SetLocoFunctionGroup(group) => D::x(0xE4, Some(group.sub_command())),
            Command::CvPomWriteByte => D::pom(0xEC),
            Command::CvPomReadByte => D::pom(0xE4),
            Command::GetFirmwareVersion => D::x(0xF1, Some(0x0A)),

            Command::BcTrackPowerOff => D::x(0x61, Some(0x00)),
            Command::BcTrackPowerOn => D::x(0x61, Some(0x01)),
            Command::BcProgrammingMode => D::x(0x61, Some(0x02)),
            Command::BcTrackShortCircuit => D::x(0x61, Some(0x08)),
            Command::CvNackShortCircuit => D::x(0x61, Some(0x12)),
            Command::CvNack => D::x(0x61, Some(0x13)),
            Command::UnknownCommand => D::x(0x61, Some(0x82)),
            Command::StatusChanged => D::x(0x62, Some(0x22)),
            Command::VersionInfo => D::x(0x63, Some(0x21)),
            Command::CvResult => D::x(0x64, Some(0x14)),
            Command::BcStopped => D::x(0x81, Some(0x00)),
            Command::LocoInfo => D::x(0xEF, None),
            Command::FirmwareVersion => D::x(0xF3, Some(0x0A)),
        }
    }

    /// Direction the command travels in
    pub const fn flow(self) -> Flow {
        match self {
            Command::SerialNumber
            | Command::HardwareInfo
            | Command::BroadcastFlags
            | Command::SystemStateDataChanged
            | Command::BcTrackPowerOff
            | Command::BcTrackPowerOn
            | Command::BcProgrammingMode
            | Command::BcTrackShortCircuit
            | Command::CvNackShortCircuit
            | Command::CvNack
            | Command::UnknownCommand
            | Command::StatusChanged
            | Command::VersionInfo
            | Command::CvResult
            | Command::BcStopped
            | Command::LocoInfo
            | Command::TurnoutInfo
            | Command::ExtAccessoryInfo
            | Command::FirmwareVersion => Flow::Inbound,
            _ => Flow::Outbound,
        }
    }

    /// Protocol name of the command
    pub const fn name(self) -> &'static str {
        match self {
            Command::GetSerialNumber => "LAN_GET_SERIAL_NUMBER",
            Command::GetHardwareInfo => "LAN_GET_HWINFO",
            Command::Logoff => "LAN_LOGOFF",
            Command::SetBroadcastFlags => "LAN_SET_BROADCASTFLAGS",
            Command::GetBroadcastFlags => "LAN_GET_BROADCASTFLAGS",
            Command::GetSystemState => "LAN_SYSTEMSTATE_GETDATA",
            Command::GetVersion => "LAN_X_GET_VERSION",
            Command::GetStatus => "LAN_X_GET_STATUS",
            Command::SetTrackPowerOff => "LAN_X_SET_TRACK_POWER_OFF",
            Command::SetTrackPowerOn => "LAN_X_SET_TRACK_POWER_ON",
            Command::CvRead => "LAN_X_CV_READ",
            Command::CvWrite => "LAN_X_CV_WRITE",
            Command::GetTurnoutInfo => "LAN_X_GET_TURNOUT_INFO",
            Command::SetTurnout => "LAN_X_SET_TURNOUT",
            Command::GetExtAccessoryInfo => "LAN_X_GET_EXT_ACCESSORY_INFO",
            Command::SetExtAccessory => "LAN_X_SET_EXT_ACCESSORY",
            Command::SetStop => "LAN_X_SET_STOP",
            Command::SetLocoEStop => "LAN_X_SET_LOCO_E_STOP",
            Command::GetLocoInfo => "LAN_X_GET_LOCO_INFO",
            Command::SetLocoDrive14 => "LAN_X_SET_LOCO_DRIVE_14",
            Command::SetLocoDrive28 => "LAN_X_SET_LOCO_DRIVE_28",
            Command::SetLocoDrive128 => "LAN_X_SET_LOCO_DRIVE_128",
            Command::SetLocoFunction => "LAN_X_SET_LOCO_FUNCTION",
            Command::SetLocoFunctionGroup(FunctionGroup::F0ToF4) => "LAN_X_SET_LOCO_FUNCTION_GROUP_1",
            Command::SetLocoFunctionGroup(FunctionGroup::F5ToF8) => "LAN_X_SET_LOCO_FUNCTION_GROUP_2",
            Command::SetLocoFunctionGroup(FunctionGroup::F9ToF12) => "LAN_X_SET_LOCO_FUNCTION_GROUP_3",
            Command::SetLocoFunctionGroup(FunctionGroup::F13ToF20) => "LAN_X_SET_LOCO_FUNCTION_GROUP_4",
            Command::SetLocoFunctionGroup(FunctionGroup::F21ToF28) => "LAN_X_SET_LOCO_FUNCTION_GROUP_5",
            Command::SetLocoFunctionGroup(FunctionGroup::F29ToF31) => "LAN_X_SET_LOCO_FUNCTION_GROUP_6",
            Command::CvPomWriteByte => "LAN_X_CV_POM_WRITE_BYTE",
            Command::CvPomReadByte => "LAN_X_CV_POM_READ_BYTE",
            Command::GetFirmwareVersion => "LAN_X_GET_FIRMWARE_VERSION",
            Command::SerialNumber => "LAN_SERIAL_NUMBER",
            Command::HardwareInfo => "LAN_HWINFO",
            Command::BroadcastFlags => "LAN_BROADCASTFLAGS",
            Command::SystemStateDataChanged => "LAN_SYSTEMSTATE_DATACHANGED",
            Command::BcTrackPowerOff => "LAN_X_BC_TRACK_POWER_OFF",
            Command::BcTrackPowerOn => "LAN_X_BC_TRACK_POWER_ON",
            Command::BcProgrammingMode => "LAN_X_BC_PROGRAMMING_MODE",
            Command::BcTrackShortCircuit => "LAN_X_BC_TRACK_SHORT_CIRCUIT",
            Command::CvNackShortCircuit => "LAN_X_CV_NACK_SC",
            Command::CvNack => "LAN_X_CV_NACK",
            Command::UnknownCommand => "LAN_X_UNKNOWN_COMMAND",
            Command::StatusChanged => "LAN_X_STATUS_CHANGED",
            Command::VersionInfo => "LAN_X_VERSION",
            Command::CvResult => "LAN_X_CV_RESULT",
            Command::BcStopped => "LAN_X_BC_STOPPED",
            Command::LocoInfo => "LAN_X_LOCO_INFO",
            Command::TurnoutInfo => "LAN_X_TURNOUT_INFO",
            Command::ExtAccessoryInfo => "LAN_X_EXT_ACCESSORY_INFO",
            Command::FirmwareVersion => "LAN_X_FIRMWARE_VERSION",
        }
    }
}

/// Dispatch key of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FrameKey {
    flow: Flow,
    family: u16,
    header: Option<u8>,
    sub_command: Option<u8>,
    option: Option<u8>,
}

impl FrameKey {
    fn of(command: Command) -> Self {
        let d = command.descriptor();
        FrameKey {
            flow: command.flow(),
            family: d.family,
            header: d.header,
            sub_command: d.sub_command,
            option: d.option,
        }
    }
}

/// Read-only lookup tables built from [`Command::ALL`]
#[derive(Debug)]
pub struct Registry {
    by_key: HashMap<FrameKey, Command>,
}

impl Registry {
    /// Builds the lookup tables
    pub fn new() -> Self {
        let mut by_key = HashMap::with_capacity(Command::ALL.len());
        for command in Command::ALL {
            by_key.insert(FrameKey::of(command), command);
        }
        Registry { by_key }
    }

    /// Process-wide registry, built on first use and never mutated
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::new)
    }

    /// Finds the command for a frame's leading bytes
    ///
    /// `sub_command` and `option` are the bytes at the positions where a
    /// sub-command or option byte would sit; the most specific match wins, so
    /// frames whose second byte is data (turnout info, loco info) still resolve.
    pub fn lookup(
        &self,
        flow: Flow,
        family: u16,
        header: Option<u8>,
        sub_command: Option<u8>,
        option: Option<u8>,
    ) -> Option<Command> {
        let key = |sub_command, option| FrameKey {
            flow,
            family,
            header,
            sub_command,
            option,
        };

        if let (Some(sub), Some(opt)) = (sub_command, option) {
            if let Some(command) = self.by_key.get(&key(Some(sub), Some(opt & POM_OPTION_MASK))) {
                return Some(*command);
            }
        }
        if sub_command.is_some() {
            if let Some(command) = self.by_key.get(&key(sub_command, None)) {
                return Some(*command);
            }
        }
        self.by_key.get(&key(None, None)).copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_command_resolves_to_itself() {
        let registry = Registry::new();
        for command in Command::ALL {
            let d = command.descriptor();
            let found = registry.lookup(command.flow(), d.family, d.header, d.sub_command, d.option);
            assert_eq!(found, Some(command), "{}", command.name());
        }
    }

    #[test]
    fn test_keys_are_unique_per_flow() {
        let registry = Registry::new();
        assert_eq!(registry.by_key.len(), Command::ALL.len());
        let names: std::collections::HashSet<_> = Command::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), Command::ALL.len());
    }

    #[test]
    fn test_data_bytes_fall_back_to_header() {
        let registry = Registry::global();
        // Loco info: the byte after the header is the address MSB
        assert_eq!(
            registry.lookup(Flow::Inbound, FAMILY_X, Some(0xEF), Some(0xC7), Some(0x04)),
            Some(Command::LocoInfo)
        );
        assert_eq!(
            registry.lookup(Flow::Inbound, FAMILY_X, Some(0x43), Some(0x00), Some(0x01)),
            Some(Command::TurnoutInfo)
        );
        // Same bytes mean different things in each direction
        assert_eq!(
            registry.lookup(Flow::Outbound, FAMILY_X, Some(0x43), Some(0x00), None),
            Some(Command::GetTurnoutInfo)
        );
        assert_eq!(registry.lookup(Flow::Inbound, FAMILY_X, Some(0x61), Some(0x55), None), None);
    }

    #[test]
    fn test_pom_option_carries_cv_bits() {
        let registry = Registry::global();
        assert_eq!(
            registry.lookup(Flow::Outbound, FAMILY_X, Some(0xE6), Some(0x30), Some(0xEF)),
            Some(Command::CvPomWriteByte)
        );
        assert_eq!(
            registry.lookup(Flow::Outbound, FAMILY_X, Some(0xE6), Some(0x30), Some(0xE5)),
            Some(Command::CvPomReadByte)
        );
    }

    #[test]
    fn test_function_groups() {
        assert_eq!(FunctionGroup::from_index(1), Some(FunctionGroup::F0ToF4));
        assert_eq!(FunctionGroup::from_index(6), Some(FunctionGroup::F29ToF31));
        assert_eq!(FunctionGroup::from_index(0), None);
        assert_eq!(FunctionGroup::from_index(7), None);
        assert_eq!(FunctionGroup::F13ToF20.functions().count(), 8);
    }
}
