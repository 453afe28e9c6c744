//! LAN frame codec
//!
//! Every frame starts with `[length: u16 LE][family: u16 LE]`. Frames of the
//! X family continue with an X-Bus header, an optional sub-command, the
//! parameters and a trailing XOR checksum over everything after the family.
//! Other families carry fixed little-endian fields directly after the family.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{info, trace, warn};

use crate::core::{
    BroadcastFlags, CentralState, CentralStateEx, Direction, Error, FrameError, FunctionMap,
    LocoAddress, SpeedSteps, TurnoutState,
};
use crate::util;

use super::command::{FunctionAction, LanCommand};
use super::event::{
    DomainEvent, ExtAccessoryInfo, LanEvent, LocoInfo, SystemState, TrackPowerChange, TurnoutInfo,
};
use super::registry::{Command, Flow, FunctionGroup, Registry, FAMILY_X};

/// Bytes before the payload of every frame
const FRAME_HEADER_LEN: usize = 4;

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Encodes a locomotive address; long addresses get the `11` marker bits
pub fn encode_loco_address(addr: u16) -> [u8; 2] {
    if addr >= 128 {
        [0xC0 | ((addr >> 8) as u8 & 0x3F), addr as u8]
    } else {
        [0x00, addr as u8]
    }
}

/// Inverse of [`encode_loco_address`]
pub fn decode_loco_address(msb: u8, lsb: u8) -> u16 {
    (u16::from(msb & 0x3F) << 8) | u16::from(lsb)
}

/// Encodes the speed/direction byte of a drive or loco info frame
///
/// 128 and 14 step modes count raw values from 2 (raw 0 stop, raw 1 emergency
/// stop). The 28 step mode moves the lowest bit of the 5-bit raw value to bit 4.
pub fn encode_speed(steps: SpeedSteps, speed: u8, direction: Direction, emergency_stop: bool) -> u8 {
    let dir = match direction {
        Direction::Forward => 0x80,
        Direction::Reverse => 0x00,
    };
    let speed = speed.min(steps.max_speed());

    let value = match steps {
        SpeedSteps::Steps14 | SpeedSteps::Steps128 => match (emergency_stop, speed) {
            (true, _) => 1,
            (false, 0) => 0,
            (false, s) => s + 1,
        },
        SpeedSteps::Steps28 => {
            let raw = match (emergency_stop, speed) {
                (true, _) => 2,
                (false, 0) => 0,
                (false, s) => s + 3,
            };
            ((raw >> 1) & 0x0F) | ((raw & 0x01) << 4)
        }
    };

    dir | value
}

/// Inverse of [`encode_speed`]: `(speed, direction, emergency_stop)`
pub fn decode_speed(steps: SpeedSteps, byte: u8) -> (u8, Direction, bool) {
    let direction = if byte & 0x80 != 0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };

    let (speed, emergency_stop) = match steps {
        SpeedSteps::Steps14 | SpeedSteps::Steps128 => {
            let mask = if steps == SpeedSteps::Steps14 { 0x0F } else { 0x7F };
            match byte & mask {
                0 => (0, false),
                1 => (0, true),
                raw => (raw - 1, false),
            }
        }
        SpeedSteps::Steps28 => match ((byte & 0x0F) << 1) | ((byte >> 4) & 0x01) {
            0 | 1 => (0, false),
            2 | 3 => (0, true),
            raw => (raw - 3, false),
        },
    };

    (speed, direction, emergency_stop)
}

fn steps_code(steps: SpeedSteps) -> u8 {
    match steps {
        SpeedSteps::Steps14 => 0,
        SpeedSteps::Steps28 => 2,
        SpeedSteps::Steps128 => 4,
    }
}

fn steps_from_code(code: u8) -> SpeedSteps {
    match code & 0x07 {
        0 | 1 => SpeedSteps::Steps14,
        2 | 3 => SpeedSteps::Steps28,
        _ => SpeedSteps::Steps128,
    }
}

// F0 sits above F1..F4 in the first function byte
fn pack_f0_f4(fns: &FunctionMap) -> u8 {
    (1..=4).fold(u8::from(fns.get(0)) << 4, |byte, n| byte | (u8::from(fns.get(n)) << (n - 1)))
}

fn unpack_f0_f4(byte: u8, fns: &mut FunctionMap) {
    fns.set(0, byte & 0x10 != 0);
    for n in 1..=4 {
        fns.set(n, byte & (1 << (n - 1)) != 0);
    }
}

fn pack_range(fns: &FunctionMap, first: u8, count: u8) -> u8 {
    (0..count).fold(0, |byte, i| byte | (u8::from(fns.get(first + i)) << i))
}

fn unpack_range(byte: u8, fns: &mut FunctionMap, first: u8, count: u8) {
    for i in 0..count {
        fns.set(first + i, byte & (1 << i) != 0);
    }
}

fn pack_group(group: FunctionGroup, fns: &FunctionMap) -> u8 {
    match group {
        FunctionGroup::F0ToF4 => pack_f0_f4(fns),
        other => {
            let range = other.functions();
            pack_range(fns, *range.start(), range.end() - range.start() + 1)
        }
    }
}

fn unpack_group(group: FunctionGroup, byte: u8) -> FunctionMap {
    let mut fns = FunctionMap::default();
    match group {
        FunctionGroup::F0ToF4 => unpack_f0_f4(byte, &mut fns),
        other => {
            let range = other.functions();
            unpack_range(byte, &mut fns, *range.start(), range.end() - range.start() + 1);
        }
    }
    fns
}

fn action_bits(action: FunctionAction) -> u8 {
    match action {
        FunctionAction::Off => 0x00,
        FunctionAction::On => 0x40,
        FunctionAction::Toggle => 0x80,
    }
}

fn action_from_bits(byte: u8) -> Option<FunctionAction> {
    match byte >> 6 {
        0 => Some(FunctionAction::Off),
        1 => Some(FunctionAction::On),
        2 => Some(FunctionAction::Toggle),
        _ => None,
    }
}

fn from_bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

// CVs are 1-based for users and 0-based, 10 bits wide on the wire
fn cv_to_wire(cv: u16) -> u16 {
    cv.saturating_sub(1) & 0x03FF
}

fn cv_from_wire(raw: u16) -> u16 {
    (raw & 0x03FF) + 1
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_i16(data: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn need(kind: &'static str, data: &[u8], needed: usize) -> Result<(), FrameError> {
    if data.len() < needed {
        return Err(FrameError::Truncated {
            kind,
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

/// Splits the X payload from its checksum and verifies it
fn verify_checksum(body: &[u8]) -> Result<&[u8], FrameError> {
    if body.len() < 2 {
        return Err(FrameError::TooShort {
            len: body.len() + FRAME_HEADER_LEN,
        });
    }
    let (payload, tail) = body.split_at(body.len() - 1);
    let expected = checksum(payload);
    if expected != tail[0] {
        return Err(FrameError::Checksum {
            expected,
            actual: tail[0],
        });
    }
    Ok(payload)
}

/// Parameters of an X frame after its header and sub-command
fn x_data(command: Command, payload: &[u8]) -> &[u8] {
    let skip = 1 + usize::from(command.descriptor().sub_command.is_some());
    payload.get(skip..).unwrap_or(&[])
}

fn x_frame(command: Command, data: &[u8]) -> Bytes {
    let descriptor = command.descriptor();
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.extend(descriptor.header);
    payload.extend(descriptor.sub_command);
    payload.extend_from_slice(data);

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len() + 1);
    frame.put_u16_le((FRAME_HEADER_LEN + payload.len() + 1) as u16);
    frame.put_u16_le(descriptor.family);
    frame.put_slice(&payload);
    frame.put_u8(checksum(&payload));
    frame.freeze()
}

fn flat_frame(family: u16, data: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    frame.put_u16_le((FRAME_HEADER_LEN + data.len()) as u16);
    frame.put_u16_le(family);
    frame.put_slice(data);
    frame.freeze()
}

fn pom_frame(command: Command, addr: LocoAddress, cv: u16, value: u8) -> Bytes {
    let option = command.descriptor().option.unwrap_or_default();
    let [a0, a1] = encode_loco_address(addr.value());
    let wire = cv_to_wire(cv);
    x_frame(command, &[a0, a1, option | ((wire >> 8) as u8 & 0x03), wire as u8, value])
}

/// Codec between LAN datagrams and typed events/commands
#[derive(Debug, Clone, Copy)]
pub struct LanCodec {
    registry: &'static Registry,
    /// Dump raw frames at info instead of trace
    dump_frames: bool,
}

impl Default for LanCodec {
    fn default() -> Self {
        LanCodec::new()
    }
}

impl LanCodec {
    /// Creates a codec backed by the process-wide registry
    pub fn new() -> Self {
        LanCodec {
            registry: Registry::global(),
            dump_frames: false,
        }
    }

    /// Promotes the raw frame dumps of the tokio codec impls to info
    pub fn with_frame_dumps(mut self, enabled: bool) -> Self {
        self.dump_frames = enabled;
        self
    }

    fn dump(&self, direction: &'static str, frame: &[u8]) {
        if self.dump_frames {
            info!(direction, raw = %util::to_hex(frame), "Central frame");
        } else {
            trace!(direction, raw = %util::to_hex(frame), "Central frame");
        }
    }

    /// Decodes one datagram received from the central
    ///
    /// The datagram boundary is authoritative; a disagreeing length prefix is
    /// only logged. Unknown commands decode to [`LanEvent::Unknown`].
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<DomainEvent, FrameError> {
        if datagram.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort { len: datagram.len() });
        }

        let declared = usize::from(le_u16(datagram, 0));
        if declared != datagram.len() {
            warn!(
                declared,
                actual = datagram.len(),
                raw = %util::to_hex(datagram),
                "Frame length mismatch, trusting datagram size"
            );
        }

        let family = le_u16(datagram, 2);
        let body = &datagram[FRAME_HEADER_LEN..];
        let event = if family == FAMILY_X {
            self.decode_x_event(body)?
        } else {
            self.decode_flat_event(family, body)?
        };

        Ok(DomainEvent {
            event,
            raw: Bytes::copy_from_slice(datagram),
        })
    }

    fn decode_x_event(&self, body: &[u8]) -> Result<LanEvent, FrameError> {
        let payload = verify_checksum(body)?;
        let header = payload[0];
        let Some(command) = self.registry.lookup(
            Flow::Inbound,
            FAMILY_X,
            Some(header),
            payload.get(1).copied(),
            None,
        ) else {
            return Ok(LanEvent::Unknown {
                family: FAMILY_X,
                header: Some(header),
            });
        };

        let data = x_data(command, payload);
        let kind = command.name();
        let event = match command {
            Command::LocoInfo => {
                need(kind, data, 5)?;
                let steps = steps_from_code(data[2]);
                let (speed, direction, emergency_stop) = decode_speed(steps, data[3]);
                let mut functions = FunctionMap::default();
                unpack_f0_f4(data[4], &mut functions);
                for (index, first, count) in [(5, 5, 8), (6, 13, 8), (7, 21, 8), (8, 29, 3)] {
                    if let Some(byte) = data.get(index) {
                        unpack_range(*byte, &mut functions, first, count);
                    }
                }
                LanEvent::LocoInfo(LocoInfo {
                    addr: decode_loco_address(data[0], data[1]),
                    busy: data[2] & 0x08 != 0,
                    steps,
                    direction,
                    speed,
                    emergency_stop,
                    double_traction: data[4] & 0x40 != 0,
                    smart_search: data[4] & 0x20 != 0,
                    functions,
                })
            }
            Command::TurnoutInfo => {
                need(kind, data, 3)?;
                let state = match data[2] & 0x03 {
                    0 => TurnoutState::Unknown,
                    1 => TurnoutState::Straight,
                    2 => TurnoutState::Diverging,
                    _ => TurnoutState::Invalid,
                };
                LanEvent::TurnoutInfo(TurnoutInfo {
                    addr: be_u16(data, 0),
                    state,
                })
            }
            Command::ExtAccessoryInfo => {
                need(kind, data, 4)?;
                LanEvent::ExtAccessoryInfo(ExtAccessoryInfo {
                    addr: be_u16(data, 0),
                    value: data[2],
                    valid: data[3] == 0x00,
                })
            }
            Command::BcTrackPowerOff => LanEvent::TrackPower(TrackPowerChange::Off),
            Command::BcTrackPowerOn => LanEvent::TrackPower(TrackPowerChange::On),
            Command::BcProgrammingMode => LanEvent::TrackPower(TrackPowerChange::ProgrammingMode),
            Command::BcTrackShortCircuit => LanEvent::TrackPower(TrackPowerChange::ShortCircuit),
            Command::CvNackShortCircuit => LanEvent::CvNack { short_circuit: true },
            Command::CvNack => LanEvent::CvNack { short_circuit: false },
            Command::UnknownCommand => LanEvent::UnknownCommand,
            Command::BcStopped => LanEvent::Stopped,
            Command::StatusChanged => {
                need(kind, data, 1)?;
                LanEvent::StatusChanged(CentralState(data[0]))
            }
            Command::VersionInfo => {
                need(kind, data, 2)?;
                LanEvent::Version {
                    xbus_version: data[0],
                    command_station_id: data[1],
                }
            }
            Command::CvResult => {
                need(kind, data, 3)?;
                LanEvent::CvResult {
                    cv: cv_from_wire(be_u16(data, 0)),
                    value: data[2],
                }
            }
            Command::FirmwareVersion => {
                need(kind, data, 2)?;
                LanEvent::FirmwareVersion {
                    major: from_bcd(data[0]),
                    minor: from_bcd(data[1]),
                }
            }
            _ => LanEvent::Unknown {
                family: FAMILY_X,
                header: Some(header),
            },
        };

        Ok(event)
    }

    fn decode_flat_event(&self, family: u16, data: &[u8]) -> Result<LanEvent, FrameError> {
        let Some(command) = self.registry.lookup(Flow::Inbound, family, None, None, None) else {
            return Ok(LanEvent::Unknown { family, header: None });
        };

        let kind = command.name();
        let event = match command {
            Command::SerialNumber => {
                need(kind, data, 4)?;
                LanEvent::SerialNumber(le_u32(data, 0))
            }
            Command::HardwareInfo => {
                need(kind, data, 8)?;
                LanEvent::HardwareInfo {
                    hw_type: le_u32(data, 0),
                    firmware: le_u32(data, 4),
                }
            }
            Command::BroadcastFlags => {
                need(kind, data, 4)?;
                LanEvent::BroadcastFlags(le_u32(data, 0))
            }
            Command::SystemStateDataChanged => {
                need(kind, data, 14)?;
                LanEvent::SystemState(SystemState {
                    main_current: le_i16(data, 0),
                    prog_current: le_i16(data, 2),
                    filtered_main_current: le_i16(data, 4),
                    temperature: le_i16(data, 6),
                    supply_voltage: le_u16(data, 8),
                    vcc_voltage: le_u16(data, 10),
                    central_state: CentralState(data[12]),
                    central_state_ex: CentralStateEx(data[13]),
                    capabilities: data.get(15).copied().unwrap_or_default(),
                })
            }
            _ => LanEvent::Unknown { family, header: None },
        };

        Ok(event)
    }

    /// Builds the datagram for a command to the central
    pub fn encode_command(&self, command: &LanCommand) -> Bytes {
        let name = command.command();
        let family = name.descriptor().family;

        match *command {
            LanCommand::GetSerialNumber
            | LanCommand::GetHardwareInfo
            | LanCommand::Logoff
            | LanCommand::GetBroadcastFlags
            | LanCommand::GetSystemState => flat_frame(family, &[]),
            LanCommand::SetBroadcastFlags(flags) => flat_frame(family, &flags.0.to_le_bytes()),
            LanCommand::GetVersion
            | LanCommand::GetStatus
            | LanCommand::SetTrackPower { .. }
            | LanCommand::SetStop
            | LanCommand::GetFirmwareVersion => x_frame(name, &[]),
            LanCommand::CvRead { cv } => x_frame(name, &cv_to_wire(cv).to_be_bytes()),
            LanCommand::CvWrite { cv, value } => {
                let [msb, lsb] = cv_to_wire(cv).to_be_bytes();
                x_frame(name, &[msb, lsb, value])
            }
            LanCommand::GetTurnoutInfo { addr } => x_frame(name, &addr.to_be_bytes()),
            LanCommand::SetTurnout {
                addr,
                output,
                activate,
                queue,
            } => {
                let [msb, lsb] = addr.to_be_bytes();
                let mut flags = 0x80;
                if queue {
                    flags |= 0x20;
                }
                if activate {
                    flags |= 0x08;
                }
                if output != TurnoutState::Straight {
                    flags |= 0x01;
                }
                x_frame(name, &[msb, lsb, flags])
            }
            LanCommand::GetExtAccessoryInfo { addr } => {
                let [msb, lsb] = addr.to_be_bytes();
                x_frame(name, &[msb, lsb, 0x00])
            }
            LanCommand::SetExtAccessory { addr, value } => {
                let [msb, lsb] = addr.to_be_bytes();
                x_frame(name, &[msb, lsb, value, 0x00])
            }
            LanCommand::LocoEStop { addr } | LanCommand::GetLocoInfo { addr } => {
                x_frame(name, &encode_loco_address(addr.value()))
            }
            LanCommand::LocoDrive {
                addr,
                steps,
                direction,
                speed,
                emergency_stop,
            } => {
                let [a0, a1] = encode_loco_address(addr.value());
                x_frame(name, &[a0, a1, encode_speed(steps, speed, direction, emergency_stop)])
            }
            LanCommand::LocoFunction {
                addr,
                function,
                action,
            } => {
                let [a0, a1] = encode_loco_address(addr.value());
                x_frame(name, &[a0, a1, action_bits(action) | (function & 0x3F)])
            }
            LanCommand::LocoFunctionGroup {
                addr,
                group,
                functions,
            } => {
                let [a0, a1] = encode_loco_address(addr.value());
                x_frame(name, &[a0, a1, pack_group(group, &functions)])
            }
            LanCommand::PomWriteByte { addr, cv, value } => pom_frame(name, addr, cv, value),
            LanCommand::PomReadByte { addr, cv } => pom_frame(name, addr, cv, 0),
        }
    }

    /// Decodes a command frame as sent to the central
    ///
    /// `Ok(None)` means the frame is well formed but is not a known command.
    pub fn decode_command(&self, frame: &[u8]) -> Result<Option<LanCommand>, FrameError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort { len: frame.len() });
        }

        let family = le_u16(frame, 2);
        let body = &frame[FRAME_HEADER_LEN..];
        if family != FAMILY_X {
            let command = self.registry.lookup(Flow::Outbound, family, None, None, None);
            return Ok(match command {
                Some(Command::GetSerialNumber) => Some(LanCommand::GetSerialNumber),
                Some(Command::GetHardwareInfo) => Some(LanCommand::GetHardwareInfo),
                Some(Command::Logoff) => Some(LanCommand::Logoff),
                Some(Command::GetBroadcastFlags) => Some(LanCommand::GetBroadcastFlags),
                Some(Command::GetSystemState) => Some(LanCommand::GetSystemState),
                Some(Command::SetBroadcastFlags) => {
                    need("LAN_SET_BROADCASTFLAGS", body, 4)?;
                    Some(LanCommand::SetBroadcastFlags(BroadcastFlags(le_u32(body, 0))))
                }
                _ => None,
            });
        }

        let payload = verify_checksum(body)?;
        let Some(command) = self.registry.lookup(
            Flow::Outbound,
            FAMILY_X,
            Some(payload[0]),
            payload.get(1).copied(),
            payload.get(4).copied(),
        ) else {
            return Ok(None);
        };

        let data = x_data(command, payload);
        let kind = command.name();
        let loco = |data: &[u8]| LocoAddress::new(decode_loco_address(data[0], data[1]));

        let decoded = match command {
            Command::GetVersion => Some(LanCommand::GetVersion),
            Command::GetStatus => Some(LanCommand::GetStatus),
            Command::SetTrackPowerOff => Some(LanCommand::SetTrackPower { on: false }),
            Command::SetTrackPowerOn => Some(LanCommand::SetTrackPower { on: true }),
            Command::SetStop => Some(LanCommand::SetStop),
            Command::GetFirmwareVersion => Some(LanCommand::GetFirmwareVersion),
            Command::CvRead => {
                need(kind, data, 2)?;
                Some(LanCommand::CvRead {
                    cv: cv_from_wire(be_u16(data, 0)),
                })
            }
            Command::CvWrite => {
                need(kind, data, 3)?;
                Some(LanCommand::CvWrite {
                    cv: cv_from_wire(be_u16(data, 0)),
                    value: data[2],
                })
            }
            Command::GetTurnoutInfo => {
                need(kind, data, 2)?;
                Some(LanCommand::GetTurnoutInfo { addr: be_u16(data, 0) })
            }
            Command::SetTurnout => {
                need(kind, data, 3)?;
                let output = if data[2] & 0x01 == 0 {
                    TurnoutState::Straight
                } else {
                    TurnoutState::Diverging
                };
                Some(LanCommand::SetTurnout {
                    addr: be_u16(data, 0),
                    output,
                    activate: data[2] & 0x08 != 0,
                    queue: data[2] & 0x20 != 0,
                })
            }
            Command::GetExtAccessoryInfo => {
                need(kind, data, 2)?;
                Some(LanCommand::GetExtAccessoryInfo { addr: be_u16(data, 0) })
            }
            Command::SetExtAccessory => {
                need(kind, data, 3)?;
                Some(LanCommand::SetExtAccessory {
                    addr: be_u16(data, 0),
                    value: data[2],
                })
            }
            Command::SetLocoEStop => {
                need(kind, data, 2)?;
                loco(data).map(|addr| LanCommand::LocoEStop { addr })
            }
            Command::GetLocoInfo => {
                need(kind, data, 2)?;
                loco(data).map(|addr| LanCommand::GetLocoInfo { addr })
            }
            Command::SetLocoDrive14 | Command::SetLocoDrive28 | Command::SetLocoDrive128 => {
                need(kind, data, 3)?;
                let steps = match command {
                    Command::SetLocoDrive14 => SpeedSteps::Steps14,
                    Command::SetLocoDrive28 => SpeedSteps::Steps28,
                    _ => SpeedSteps::Steps128,
                };
                let (speed, direction, emergency_stop) = decode_speed(steps, data[2]);
                loco(data).map(|addr| LanCommand::LocoDrive {
                    addr,
                    steps,
                    direction,
                    speed,
                    emergency_stop,
                })
            }
            Command::SetLocoFunction => {
                need(kind, data, 3)?;
                match (loco(data), action_from_bits(data[2])) {
                    (Some(addr), Some(action)) => Some(LanCommand::LocoFunction {
                        addr,
                        function: data[2] & 0x3F,
                        action,
                    }),
                    _ => None,
                }
            }
            Command::SetLocoFunctionGroup(group) => {
                need(kind, data, 3)?;
                loco(data).map(|addr| LanCommand::LocoFunctionGroup {
                    addr,
                    group,
                    functions: unpack_group(group, data[2]),
                })
            }
            Command::CvPomWriteByte | Command::CvPomReadByte => {
                need(kind, data, 5)?;
                let cv = cv_from_wire((u16::from(data[2] & 0x03) << 8) | u16::from(data[3]));
                loco(data).map(|addr| match command {
                    Command::CvPomWriteByte => LanCommand::PomWriteByte {
                        addr,
                        cv,
                        value: data[4],
                    },
                    _ => LanCommand::PomReadByte { addr, cv },
                })
            }
            _ => None,
        };

        Ok(decoded)
    }

    /// Builds the datagram the central would send for an event
    ///
    /// Used to simulate the central in tests and benchmarks.
    pub fn encode_event(&self, event: &LanEvent) -> Bytes {
        match *event {
            LanEvent::LocoInfo(info) => {
                let [a0, a1] = encode_loco_address(info.addr);
                let mut db4 = pack_f0_f4(&info.functions);
                if info.double_traction {
                    db4 |= 0x40;
                }
                if info.smart_search {
                    db4 |= 0x20;
                }
                let db2 = steps_code(info.steps) | if info.busy { 0x08 } else { 0x00 };
                x_frame(
                    Command::LocoInfo,
                    &[
                        a0,
                        a1,
                        db2,
                        encode_speed(info.steps, info.speed, info.direction, info.emergency_stop),
                        db4,
                        pack_range(&info.functions, 5, 8),
                        pack_range(&info.functions, 13, 8),
                        pack_range(&info.functions, 21, 8),
                        pack_range(&info.functions, 29, 3),
                    ],
                )
            }
            LanEvent::TurnoutInfo(info) => {
                let [msb, lsb] = info.addr.to_be_bytes();
                let zz = match info.state {
                    TurnoutState::Unknown => 0,
                    TurnoutState::Straight => 1,
                    TurnoutState::Diverging => 2,
                    TurnoutState::Invalid => 3,
                };
                x_frame(Command::TurnoutInfo, &[msb, lsb, zz])
            }
            LanEvent::ExtAccessoryInfo(info) => {
                let [msb, lsb] = info.addr.to_be_bytes();
                let status = if info.valid { 0x00 } else { 0xFF };
                x_frame(Command::ExtAccessoryInfo, &[msb, lsb, info.value, status])
            }
            LanEvent::TrackPower(change) => x_frame(
                match change {
                    TrackPowerChange::Off => Command::BcTrackPowerOff,
                    TrackPowerChange::On => Command::BcTrackPowerOn,
                    TrackPowerChange::ProgrammingMode => Command::BcProgrammingMode,
                    TrackPowerChange::ShortCircuit => Command::BcTrackShortCircuit,
                },
                &[],
            ),
            LanEvent::Stopped => x_frame(Command::BcStopped, &[]),
            LanEvent::StatusChanged(state) => x_frame(Command::StatusChanged, &[state.0]),
            LanEvent::SystemState(state) => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&state.main_current.to_le_bytes());
                data.extend_from_slice(&state.prog_current.to_le_bytes());
                data.extend_from_slice(&state.filtered_main_current.to_le_bytes());
                data.extend_from_slice(&state.temperature.to_le_bytes());
                data.extend_from_slice(&state.supply_voltage.to_le_bytes());
                data.extend_from_slice(&state.vcc_voltage.to_le_bytes());
                data.extend_from_slice(&[state.central_state.0, state.central_state_ex.0, 0x00, state.capabilities]);
                flat_frame(Command::SystemStateDataChanged.descriptor().family, &data)
            }
            LanEvent::Version {
                xbus_version,
                command_station_id,
            } => x_frame(Command::VersionInfo, &[xbus_version, command_station_id]),
            LanEvent::FirmwareVersion { major, minor } => {
                x_frame(Command::FirmwareVersion, &[to_bcd(major), to_bcd(minor)])
            }
            LanEvent::CvResult { cv, value } => {
                let [msb, lsb] = cv_to_wire(cv).to_be_bytes();
                x_frame(Command::CvResult, &[msb, lsb, value])
            }
            LanEvent::CvNack { short_circuit } => x_frame(
                if short_circuit {
                    Command::CvNackShortCircuit
                } else {
                    Command::CvNack
                },
                &[],
            ),
            LanEvent::UnknownCommand => x_frame(Command::UnknownCommand, &[]),
            LanEvent::SerialNumber(serial) => {
                flat_frame(Command::SerialNumber.descriptor().family, &serial.to_le_bytes())
            }
            LanEvent::HardwareInfo { hw_type, firmware } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&hw_type.to_le_bytes());
                data[4..].copy_from_slice(&firmware.to_le_bytes());
                flat_frame(Command::HardwareInfo.descriptor().family, &data)
            }
            LanEvent::BroadcastFlags(flags) => {
                flat_frame(Command::BroadcastFlags.descriptor().family, &flags.to_le_bytes())
            }
            LanEvent::Unknown { family, header } => match header {
                Some(header) => {
                    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + 2);
                    frame.put_u16_le((FRAME_HEADER_LEN + 2) as u16);
                    frame.put_u16_le(family);
                    frame.put_u8(header);
                    frame.put_u8(header);
                    frame.freeze()
                }
                None => flat_frame(family, &[]),
            },
        }
    }
}

impl Decoder for LanCodec {
    type Item = DomainEvent;
    type Error = Error;

    /// Treats the whole buffer as one datagram
    ///
    /// The buffer is consumed even when decoding fails, so a framed UDP
    /// stream carries on with the next datagram.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        self.dump("rx", &datagram);
        match self.decode_datagram(&datagram) {
            Ok(event) => Ok(Some(event)),
            Err(err) => {
                warn!(error = %err, raw = %util::to_hex(&datagram), "Dropping malformed frame");
                Err(err.into())
            }
        }
    }
}

impl Encoder<LanCommand> for LanCodec {
    type Error = Error;

    fn encode(&mut self, item: LanCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.encode_command(&item);
        self.dump("tx", &frame);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
