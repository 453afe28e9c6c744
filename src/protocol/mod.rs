//! Protocol implementation module
//!
//! This module defines the LAN command registry, the binary frame codec, the
//! decoded events and commands, the client JSON schema and client sessions.

pub mod codec;
pub mod command;
pub mod event;
pub mod message;
pub mod registry;
pub mod state;

pub use self::codec::LanCodec;
pub use self::command::{FunctionAction, LanCommand};
pub use self::event::{
    DomainEvent, ExtAccessoryInfo, LanEvent, LocoInfo, SystemState, TrackPowerChange, TurnoutInfo,
};
pub use self::message::{ClientCommand, ServerMessage};
pub use self::registry::{Command, CommandDescriptor, Flow, FunctionGroup, Registry};
pub use self::state::{ClientSession, HandshakeInfo, SessionState};
