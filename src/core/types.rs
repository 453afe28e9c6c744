use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest locomotive address the central accepts
pub const MAX_LOCO_ADDRESS: u16 = 9999;

/// A DCC locomotive address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct LocoAddress(u16);

impl LocoAddress {
    /// Creates a locomotive address, rejecting 0 and anything above 9999
    pub fn new(addr: u16) -> Option<Self> {
        (1..=MAX_LOCO_ADDRESS).contains(&addr).then_some(LocoAddress(addr))
    }

    /// Returns the numeric address
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for LocoAddress {
    type Error = String;

    fn try_from(addr: u16) -> Result<Self, Self::Error> {
        LocoAddress::new(addr)
            .ok_or_else(|| format!("locomotive address {} out of range 1..={}", addr, MAX_LOCO_ADDRESS))
    }
}

impl From<LocoAddress> for u16 {
    fn from(addr: LocoAddress) -> u16 {
        addr.0
    }
}

impl fmt::Display for LocoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Travel direction of a locomotive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "FWD")]
    Forward,
    #[serde(rename = "REV")]
    Reverse,
}

/// Speed step mode of a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SpeedSteps {
    Steps14,
    Steps28,
    #[default]
    Steps128,
}

impl SpeedSteps {
    /// Highest physical speed value for this mode
    pub fn max_speed(&self) -> u8 {
        match self {
            SpeedSteps::Steps14 => 14,
            SpeedSteps::Steps28 => 28,
            SpeedSteps::Steps128 => 126,
        }
    }
}

impl TryFrom<u8> for SpeedSteps {
    type Error = String;

    fn try_from(steps: u8) -> Result<Self, Self::Error> {
        match steps {
            14 => Ok(SpeedSteps::Steps14),
            28 => Ok(SpeedSteps::Steps28),
            128 => Ok(SpeedSteps::Steps128),
            other => Err(format!("unsupported speed steps {}", other)),
        }
    }
}

impl From<SpeedSteps> for u8 {
    fn from(steps: SpeedSteps) -> u8 {
        match steps {
            SpeedSteps::Steps14 => 14,
            SpeedSteps::Steps28 => 28,
            SpeedSteps::Steps128 => 128,
        }
    }
}

/// Position of a two-output turnout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TurnoutState {
    /// Not switched since the central started
    Unknown,
    /// Output 1
    Straight,
    /// Output 2
    Diverging,
    /// Both outputs reported, never a commanded state
    Invalid,
}

/// F0..F31 packed as one bit per function, bit n = Fn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FunctionMap(u32);

impl FunctionMap {
    /// Number of functions tracked
    pub const COUNT: u8 = 32;

    /// Returns the raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns whether function `n` is on; out of range functions are off
    pub fn get(&self, n: u8) -> bool {
        n < Self::COUNT && self.0 & (1 << n) != 0
    }

    /// Switches function `n`; out of range functions are ignored
    pub fn set(&mut self, n: u8, on: bool) {
        if n >= Self::COUNT {
            return;
        }
        if on {
            self.0 |= 1 << n;
        } else {
            self.0 &= !(1 << n);
        }
    }

    /// One entry per function, index = function number
    pub fn to_vec(&self) -> Vec<bool> {
        (0..Self::COUNT).map(|n| self.get(n)).collect()
    }

    /// Builds a map from a list where index = function number
    pub fn from_slice(fns: &[bool]) -> Self {
        let mut map = FunctionMap::default();
        for (n, on) in fns.iter().enumerate().take(Self::COUNT as usize) {
            map.set(n as u8, *on);
        }
        map
    }
}

impl Serialize for FunctionMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FunctionMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fns = Vec::<bool>::deserialize(deserializer)?;
        Ok(FunctionMap::from_slice(&fns))
    }
}

/// Central state byte reported by status and system state frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CentralState(pub u8);

impl CentralState {
    pub const EMERGENCY_STOP: u8 = 0x01;
    pub const TRACK_VOLTAGE_OFF: u8 = 0x02;
    pub const SHORT_CIRCUIT: u8 = 0x04;
    pub const PROGRAMMING_MODE: u8 = 0x20;

    pub fn emergency_stop(&self) -> bool {
        self.0 & Self::EMERGENCY_STOP != 0
    }

    pub fn track_voltage_off(&self) -> bool {
        self.0 & Self::TRACK_VOLTAGE_OFF != 0
    }

    pub fn short_circuit(&self) -> bool {
        self.0 & Self::SHORT_CIRCUIT != 0
    }

    pub fn programming_mode(&self) -> bool {
        self.0 & Self::PROGRAMMING_MODE != 0
    }
}

/// Extended central state byte of the system state frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CentralStateEx(pub u8);

impl CentralStateEx {
    pub const HIGH_TEMPERATURE: u8 = 0x01;
    pub const POWER_LOST: u8 = 0x02;
    pub const SHORT_CIRCUIT_EXTERNAL: u8 = 0x04;
    pub const SHORT_CIRCUIT_INTERNAL: u8 = 0x08;
    pub const RCN213: u8 = 0x20;

    pub fn high_temperature(&self) -> bool {
        self.0 & Self::HIGH_TEMPERATURE != 0
    }

    pub fn power_lost(&self) -> bool {
        self.0 & Self::POWER_LOST != 0
    }

    pub fn short_circuit_external(&self) -> bool {
        self.0 & Self::SHORT_CIRCUIT_EXTERNAL != 0
    }

    pub fn short_circuit_internal(&self) -> bool {
        self.0 & Self::SHORT_CIRCUIT_INTERNAL != 0
    }

    pub fn rcn213(&self) -> bool {
        self.0 & Self::RCN213 != 0
    }
}

/// Notification categories the gateway subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastFlags(pub u32);

impl BroadcastFlags {
    pub const DRIVING_SWITCHING: u32 = 0x0000_0001;
    pub const RBUS: u32 = 0x0000_0002;
    pub const RAILCOM: u32 = 0x0000_0004;
    pub const SYSTEM_STATE: u32 = 0x0000_0100;
    pub const ALL_LOCOS: u32 = 0x0001_0000;
    pub const CAN_BOOSTER: u32 = 0x0002_0000;
    pub const RAILCOM_ALL: u32 = 0x0004_0000;
    pub const LOCONET: u32 = 0x0100_0000;

    pub fn driving_switching(&self) -> bool {
        self.0 & Self::DRIVING_SWITCHING != 0
    }

    pub fn system_state(&self) -> bool {
        self.0 & Self::SYSTEM_STATE != 0
    }

    pub fn all_locos(&self) -> bool {
        self.0 & Self::ALL_LOCOS != 0
    }

    pub fn railcom(&self) -> bool {
        self.0 & Self::RAILCOM != 0
    }
}

impl Default for BroadcastFlags {
    fn default() -> Self {
        BroadcastFlags(Self::DRIVING_SWITCHING | Self::SYSTEM_STATE | Self::ALL_LOCOS)
    }
}

/// Identifies a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gateway-side identifier of a programming request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
