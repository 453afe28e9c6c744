//! Client message schema
//!
//! Clients exchange JSON envelopes `{ "type": ..., "payload": {...} }`. Older
//! clients put the fields next to `type` instead of inside `payload`; both
//! shapes are accepted on input. Output always uses `payload`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{
    Direction, Error, FunctionMap, LocoAddress, ProgrammingError, Result, SessionId, SpeedSteps,
    TurnoutState,
};
use crate::util;

use super::event::{DomainEvent, ExtAccessoryInfo, LanEvent, LocoInfo, SystemState, TurnoutInfo};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Commands a client sends to the gateway
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Starts (or restarts) the replay for this session
    #[serde(rename = "server.command.session.hello", rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        protocol_version: Option<u32>,
        #[serde(default)]
        client_name: Option<String>,
    },

    #[serde(rename = "loco.command.drive")]
    Drive {
        addr: LocoAddress,
        speed: u8,
        #[serde(default)]
        dir: Direction,
        #[serde(default)]
        steps: SpeedSteps,
    },

    #[serde(rename = "loco.command.eStop")]
    EmergencyStop { addr: LocoAddress },

    #[serde(rename = "loco.command.function.set")]
    FunctionSet {
        addr: LocoAddress,
        #[serde(rename = "fn")]
        function: u8,
        on: bool,
    },

    #[serde(rename = "loco.command.function.toggle")]
    FunctionToggle {
        addr: LocoAddress,
        #[serde(rename = "fn")]
        function: u8,
    },

    /// `fns[i]` is the i-th function of the group, lowest first
    #[serde(rename = "loco.command.function.group.set")]
    FunctionGroupSet {
        addr: LocoAddress,
        group: u8,
        fns: Vec<bool>,
    },

    #[serde(rename = "loco.command.info.get")]
    LocoInfoGet { addr: LocoAddress },

    #[serde(rename = "switching.command.turnout.set", rename_all = "camelCase")]
    TurnoutSet {
        addr: u16,
        state: TurnoutState,
        #[serde(default)]
        pulse_ms: Option<u64>,
    },

    #[serde(rename = "switching.command.turnout.get")]
    TurnoutGet { addr: u16 },

    #[serde(rename = "switching.command.extaccessory.set")]
    ExtAccessorySet { addr: u16, value: u8 },

    #[serde(rename = "switching.command.extaccessory.get")]
    ExtAccessoryGet { addr: u16 },

    #[serde(rename = "system.command.trackpower.set")]
    TrackPowerSet { on: bool },

    /// Emergency stop of every locomotive
    #[serde(rename = "system.command.stop")]
    Stop {},

    #[serde(rename = "system.command.status.get")]
    StatusGet {},

    #[serde(rename = "system.command.version.get")]
    VersionGet {},

    #[serde(rename = "system.command.firmware.get")]
    FirmwareGet {},

    /// Without `addr` the programming track is used, with it programming on main
    #[serde(rename = "programming.command.cv.read", rename_all = "camelCase")]
    CvRead {
        #[serde(default)]
        request_id: Value,
        cv: u16,
        #[serde(default)]
        addr: Option<LocoAddress>,
    },

    #[serde(rename = "programming.command.cv.write", rename_all = "camelCase")]
    CvWrite {
        #[serde(default)]
        request_id: Value,
        cv: u16,
        value: u8,
        #[serde(default)]
        addr: Option<LocoAddress>,
    },
}

impl ClientCommand {
    /// Parses one text frame from a client
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let mut fields = match envelope.payload {
            Some(Value::Object(fields)) => fields,
            Some(other) => {
                return Err(Error::protocol(format!(
                    "payload of {} must be an object, got {}",
                    envelope.kind, other
                )))
            }
            None => envelope.extra,
        };
        fields.insert("type".to_string(), Value::String(envelope.kind));

        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Messages the gateway sends to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// Marks the end of the replay burst
    #[serde(rename = "server.replay.session.ready", rename_all = "camelCase")]
    SessionReady {
        session_id: SessionId,
        protocol_version: u32,
    },

    /// A client message could not be handled
    #[serde(rename = "server.replay.error")]
    Error { message: String },

    #[serde(rename = "loco.message.state")]
    LocoState {
        addr: u16,
        speed: u8,
        dir: Direction,
        estop: bool,
        fns: FunctionMap,
        steps: SpeedSteps,
        busy: bool,
    },

    #[serde(rename = "switching.message.turnout.state")]
    TurnoutState { addr: u16, state: TurnoutState },

    #[serde(rename = "switching.message.extaccessory.state")]
    ExtAccessoryState { addr: u16, value: u8, valid: bool },

    #[serde(rename = "system.message.trackpower", rename_all = "camelCase")]
    TrackPower {
        on: bool,
        short: bool,
        emergency_stop: bool,
        programming_mode: bool,
    },

    #[serde(rename = "system.message.systemstate")]
    SystemState(SystemState),

    #[serde(rename = "system.message.version", rename_all = "camelCase")]
    Version {
        xbus_version: String,
        command_station_id: u8,
    },

    #[serde(rename = "system.message.firmware")]
    Firmware { major: u8, minor: u8, version: String },

    #[serde(rename = "system.message.hwinfo", rename_all = "camelCase")]
    HardwareInfo { hw_type: u32, firmware: String },

    #[serde(rename = "system.message.serial")]
    SerialNumber { serial: u32 },

    /// The central rejected a command
    #[serde(rename = "system.message.unknownCommand")]
    UnknownCommand,

    /// A frame the gateway could not interpret, forwarded for diagnostics
    #[serde(rename = "system.message.unknown")]
    Unknown { raw: String },

    #[serde(rename = "programming.replay.cv.result", rename_all = "camelCase")]
    CvResult {
        request_id: Value,
        cv: u16,
        cv_value: u8,
    },

    #[serde(rename = "programming.replay.cv.nack", rename_all = "camelCase")]
    CvNack {
        request_id: Value,
        cv: u16,
        error: String,
    },
}

// Firmware versions are BCD, 0x0143 reads as 1.43
fn bcd_version(major: u32, minor: u32) -> String {
    format!("{:x}.{:02x}", major & 0xFF, minor & 0xFF)
}

impl ServerMessage {
    /// Serializes the message into a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn loco(info: &LocoInfo) -> Self {
        ServerMessage::LocoState {
            addr: info.addr,
            speed: info.speed,
            dir: info.direction,
            estop: info.emergency_stop,
            fns: info.functions,
            steps: info.steps,
            busy: info.busy,
        }
    }

    pub fn turnout(info: &TurnoutInfo) -> Self {
        ServerMessage::TurnoutState {
            addr: info.addr,
            state: info.state,
        }
    }

    pub fn ext_accessory(info: &ExtAccessoryInfo) -> Self {
        ServerMessage::ExtAccessoryState {
            addr: info.addr,
            value: info.value,
            valid: info.valid,
        }
    }

    /// Outcome of a programming request
    pub fn cv_outcome(request_id: Value, cv: u16, outcome: std::result::Result<u8, ProgrammingError>) -> Self {
        match outcome {
            Ok(cv_value) => ServerMessage::CvResult {
                request_id,
                cv,
                cv_value,
            },
            Err(err) => ServerMessage::CvNack {
                request_id,
                cv,
                error: err.to_string(),
            },
        }
    }

    /// Direct translation of a decoded event
    ///
    /// Track power, status and programming events return `None`; they are
    /// merged or correlated by the gateway before reaching clients.
    pub fn from_event(event: &DomainEvent) -> Option<Self> {
        let message = match &event.event {
            LanEvent::LocoInfo(info) => ServerMessage::loco(info),
            LanEvent::TurnoutInfo(info) => ServerMessage::turnout(info),
            LanEvent::ExtAccessoryInfo(info) => ServerMessage::ext_accessory(info),
            LanEvent::SystemState(state) => ServerMessage::SystemState(*state),
            LanEvent::Version {
                xbus_version,
                command_station_id,
            } => ServerMessage::Version {
                xbus_version: format!("{}.{}", xbus_version >> 4, xbus_version & 0x0F),
                command_station_id: *command_station_id,
            },
            LanEvent::FirmwareVersion { major, minor } => ServerMessage::Firmware {
                major: *major,
                minor: *minor,
                version: format!("{}.{:02}", major, minor),
            },
            LanEvent::HardwareInfo { hw_type, firmware } => ServerMessage::HardwareInfo {
                hw_type: *hw_type,
                firmware: bcd_version(firmware >> 8, *firmware),
            },
            LanEvent::SerialNumber(serial) => ServerMessage::SerialNumber { serial: *serial },
            LanEvent::UnknownCommand => ServerMessage::UnknownCommand,
            LanEvent::Unknown { .. } => ServerMessage::Unknown {
                raw: util::to_hex(&event.raw),
            },
            LanEvent::TrackPower(_)
            | LanEvent::Stopped
            | LanEvent::StatusChanged(_)
            | LanEvent::CvResult { .. }
            | LanEvent::CvNack { .. }
            | LanEvent::BroadcastFlags(_) => return None,
        };
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn addr(value: u16) -> LocoAddress {
        LocoAddress::new(value).unwrap()
    }

    #[test]
    fn test_parse_payload_and_top_level_fields() {
        let nested = ClientCommand::parse(
            r#"{"type":"loco.command.drive","payload":{"addr":1845,"speed":47,"dir":"FWD","steps":128}}"#,
        )
        .unwrap();
        let flat =
            ClientCommand::parse(r#"{"type":"loco.command.drive","addr":1845,"speed":47,"dir":"FWD","steps":128}"#)
                .unwrap();

        assert_eq!(nested, flat);
        assert_eq!(
            nested,
            ClientCommand::Drive {
                addr: addr(1845),
                speed: 47,
                dir: Direction::Forward,
                steps: SpeedSteps::Steps128,
            }
        );
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"switching.command.turnout.set","payload":{"addr":12,"state":"STRAIGHT"}}"#)
                .unwrap(),
            ClientCommand::TurnoutSet {
                addr: 12,
                state: TurnoutState::Straight,
                pulse_ms: None,
            }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"server.command.session.hello","payload":{"protocolVersion":1,"clientName":"cab"}}"#)
                .unwrap(),
            ClientCommand::Hello {
                protocol_version: Some(1),
                client_name: Some("cab".to_string()),
            }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"system.command.stop"}"#).unwrap(),
            ClientCommand::Stop {}
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"programming.command.cv.read","payload":{"requestId":"r1","cv":29,"addr":3}}"#)
                .unwrap(),
            ClientCommand::CvRead {
                request_id: json!("r1"),
                cv: 29,
                addr: Some(addr(3)),
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ClientCommand::parse("not json").is_err());
        assert!(ClientCommand::parse(r#"{"type":"loco.command.fly","payload":{}}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"loco.command.drive","payload":{"addr":0,"speed":1}}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"loco.command.eStop","payload":[1845]}"#).is_err());
        assert!(ClientCommand::parse(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let mut fns = FunctionMap::default();
        fns.set(3, true);
        let message = ServerMessage::LocoState {
            addr: 1845,
            speed: 0,
            dir: Direction::Forward,
            estop: false,
            fns,
            steps: SpeedSteps::Steps128,
            busy: false,
        };
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "loco.message.state");
        assert_eq!(value["payload"]["addr"], 1845);
        assert_eq!(value["payload"]["dir"], "FWD");
        assert_eq!(value["payload"]["fns"].as_array().unwrap().len(), 32);
        assert_eq!(value["payload"]["fns"][3], true);

        let ready = ServerMessage::SessionReady {
            session_id: SessionId(4),
            protocol_version: 1,
        };
        assert_eq!(
            serde_json::to_value(&ready).unwrap(),
            json!({"type": "server.replay.session.ready", "payload": {"sessionId": 4, "protocolVersion": 1}})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::UnknownCommand).unwrap(),
            json!({"type": "system.message.unknownCommand"})
        );
    }

    #[test]
    fn test_cv_outcome_messages() {
        assert_eq!(
            serde_json::to_value(ServerMessage::cv_outcome(json!(7), 29, Ok(6))).unwrap(),
            json!({"type": "programming.replay.cv.result", "payload": {"requestId": 7, "cv": 29, "cvValue": 6}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::cv_outcome(json!("a"), 1, Err(ProgrammingError::Timeout))).unwrap(),
            json!({"type": "programming.replay.cv.nack", "payload": {"requestId": "a", "cv": 1, "error": "request timed out"}})
        );
    }

    #[test]
    fn test_from_event() {
        let event = DomainEvent {
            event: LanEvent::HardwareInfo {
                hw_type: 0x0211,
                firmware: 0x0143,
            },
            raw: Bytes::new(),
        };
        assert_eq!(
            ServerMessage::from_event(&event),
            Some(ServerMessage::HardwareInfo {
                hw_type: 0x0211,
                firmware: "1.43".to_string(),
            })
        );

        let event = DomainEvent {
            event: LanEvent::Unknown { family: 0xFF, header: None },
            raw: Bytes::from_static(&[0x04, 0x00, 0xFF, 0x00]),
        };
        assert_eq!(
            ServerMessage::from_event(&event),
            Some(ServerMessage::Unknown {
                raw: "0400ff00".to_string()
            })
        );

        let event = DomainEvent {
            event: LanEvent::CvResult { cv: 1, value: 3 },
            raw: Bytes::new(),
        };
        assert_eq!(ServerMessage::from_event(&event), None);
    }
}
