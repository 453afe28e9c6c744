//! Core types and traits for the Z21 gateway
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

use std::time::Duration;

pub use self::config::{
    Config, LogFormat, ProgrammingConfig, RuntimeEnv, SafetyAction, SafetyConfig, SafetyTrigger,
    SwitchingConfig, Z21Config,
};
pub use self::error::{Error, FrameError, ProgrammingError, Result};
pub use self::types::{
    BroadcastFlags, CentralState, CentralStateEx, Direction, FunctionMap, LocoAddress, RequestId,
    SessionId, SpeedSteps, TurnoutState,
};

/// Version of the client JSON protocol
pub const PROTOCOL_VERSION: u32 = 1;

/// Default UDP port of the Z21 central
pub const DEFAULT_Z21_PORT: u16 = 21105;

/// Default port for the client WebSocket listener
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Longest turnout pulse; coils burn out well before this
pub const MAX_TURNOUT_PULSE: Duration = Duration::from_secs(10);

/// Longest a programming request may wait for the central
pub const MAX_PROGRAMMING_TIMEOUT: Duration = Duration::from_secs(300);
