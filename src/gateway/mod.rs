//! Session and broadcast dispatcher
//!
//! [`Gateway`] owns every piece of mutable state: client sessions, the replay
//! cache, the turnout scheduler and the programming correlator. It is driven
//! by one task that feeds it datagrams, client events and expired timers one
//! at a time, so nothing here needs a lock.

pub mod cache;
pub mod correlator;
pub mod safety;
pub mod scheduler;
pub mod timer;

pub use self::cache::{ReplayCache, TrackPowerState};
pub use self::correlator::{ProgrammingCorrelator, Progress, Settlement};
pub use self::safety::SafetySupervisor;
pub use self::scheduler::TurnoutScheduler;
pub use self::timer::{DelayQueueTimers, TimerHandle, TimerKind, Timers};

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{
    BroadcastFlags, Config, Error, FunctionMap, Result, SessionId, PROTOCOL_VERSION,
};
use crate::protocol::{
    ClientCommand, ClientSession, DomainEvent, FunctionAction, FunctionGroup, HandshakeInfo,
    LanCommand, LanEvent, ServerMessage, SessionState,
};
use crate::util;

/// Highest CV number a decoder exposes
const MAX_CV: u16 = 1024;

/// Input to the gateway's event loop
#[derive(Debug)]
pub enum GatewayEvent {
    /// A decoded datagram from the central
    Central(DomainEvent),
    /// A client transport is up
    ClientConnected {
        session: SessionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A text frame from a client
    ClientMessage { session: SessionId, text: String },
    /// A client transport went away
    ClientDisconnected { session: SessionId },
}

pub struct Gateway<T: Timers> {
    central: mpsc::UnboundedSender<LanCommand>,
    sessions: BTreeMap<SessionId, ClientSession>,
    cache: ReplayCache,
    scheduler: TurnoutScheduler,
    correlator: ProgrammingCorrelator,
    safety: SafetySupervisor,
    timers: T,
    broadcast_flags: BroadcastFlags,
}

impl<T: Timers> Gateway<T> {
    /// Creates a gateway queueing central commands on `central`
    pub fn new(config: &Config, timers: T, central: mpsc::UnboundedSender<LanCommand>) -> Self {
        Gateway {
            central,
            sessions: BTreeMap::new(),
            cache: ReplayCache::new(),
            scheduler: TurnoutScheduler::new(config.switching.default_pulse_ms),
            correlator: ProgrammingCorrelator::new(config.programming.timeout_ms),
            safety: SafetySupervisor::new(config.safety.clone()),
            timers,
            broadcast_flags: config.z21.broadcast_flags(),
        }
    }

    pub fn timers_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    pub fn cache(&self) -> &ReplayCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &TurnoutScheduler {
        &self.scheduler
    }

    pub fn correlator(&self) -> &ProgrammingCorrelator {
        &self.correlator
    }

    pub fn session(&self, session: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&session)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }

    /// Subscribes to broadcasts and asks the central to identify itself
    pub fn startup(&mut self) -> Result<()> {
        info!(flags = %format!("{:#010x}", self.broadcast_flags.0), "Subscribing to central broadcasts");
        for command in [
            LanCommand::SetBroadcastFlags(self.broadcast_flags),
            LanCommand::GetSerialNumber,
            LanCommand::GetHardwareInfo,
            LanCommand::GetVersion,
            LanCommand::GetFirmwareVersion,
            LanCommand::GetStatus,
            LanCommand::GetSystemState,
        ] {
            self.send(command)?;
        }
        Ok(())
    }

    /// Periodic poll; also keeps the central's client registration alive
    pub fn heartbeat(&mut self) -> Result<()> {
        self.send(LanCommand::GetSystemState)
    }

    /// Releases energized turnouts and logs off from the central
    pub fn shutdown(&mut self) -> Result<()> {
        for command in self.scheduler.drain(&mut self.timers) {
            self.send(command)?;
        }
        info!("Logging off from central");
        self.send(LanCommand::Logoff)
    }

    /// Dispatches one loop event
    pub fn handle(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Central(event) => self.handle_central(event),
            GatewayEvent::ClientConnected { session, outbound } => self.client_connected(session, outbound),
            GatewayEvent::ClientMessage { session, text } => self.client_message(session, &text),
            GatewayEvent::ClientDisconnected { session } => self.client_disconnected(session),
        }
    }

    fn send(&mut self, command: LanCommand) -> Result<()> {
        debug!(command = command.command().name(), "Sending to central");
        self.central
            .send(command)
            .map_err(|_| Error::network("central link is closed"))
    }

    fn send_logged(&mut self, command: LanCommand) {
        if let Err(err) = self.send(command) {
            warn!(error = %err, "Failed to send command to central");
        }
    }

    fn broadcast(&self, message: &ServerMessage) {
        for session in self.sessions.values().filter(|s| s.is_live()) {
            if let Err(err) = session.send(message.clone()) {
                debug!(session = %session.id(), error = %err, "Dropping live event");
            }
        }
    }

    fn deliver(&self, session: SessionId, message: ServerMessage) {
        match self.sessions.get(&session) {
            Some(client) => {
                if let Err(err) = client.send(message) {
                    debug!(%session, error = %err, "Dropping reply");
                }
            }
            None => debug!(%session, "Reply for unknown session dropped"),
        }
    }

    /// Updates the cache from a central event and fans it out
    pub fn handle_central(&mut self, event: DomainEvent) {
        debug!(kind = event.kind(), "Central event");
        let power_changed = self.cache.apply(&event.event);

        match &event.event {
            LanEvent::CvResult { .. } | LanEvent::CvNack { .. } => {
                let progress = self.correlator.on_event(&mut self.timers, &event.event);
                self.apply_progress(progress);
            }
            LanEvent::SerialNumber(serial) => info!(serial, "Central serial number"),
            LanEvent::HardwareInfo { hw_type, firmware } => {
                info!(hw_type = %format!("{:#06x}", hw_type), firmware = %format!("{:#06x}", firmware), "Central hardware")
            }
            LanEvent::FirmwareVersion { major, minor } => info!(major, minor, "Central firmware"),
            LanEvent::BroadcastFlags(flags) => debug!(flags = %format!("{:#010x}", flags), "Central broadcast flags"),
            LanEvent::UnknownCommand => warn!("Central rejected a command as unknown"),
            LanEvent::Unknown { family, header } => {
                warn!(family, ?header, raw = %util::to_hex(&event.raw), "Unknown frame from central")
            }
            _ => {}
        }

        if let Some(message) = ServerMessage::from_event(&event) {
            self.broadcast(&message);
        }

        let power_event = matches!(
            event.event,
            LanEvent::TrackPower(_) | LanEvent::Stopped | LanEvent::StatusChanged(_)
        );
        if power_event || power_changed {
            if let Some(power) = self.cache.track_power() {
                self.broadcast(&power.to_message());
            }
        }
    }

    fn apply_progress(&mut self, progress: Progress) {
        if let Some(settlement) = progress.settled {
            self.deliver(
                settlement.session,
                ServerMessage::cv_outcome(settlement.client_request_id, settlement.cv, settlement.outcome),
            );
        }
        if let Some(next) = progress.next {
            self.send_logged(next);
        }
    }

    /// Handles a fired timer
    pub fn handle_timer(&mut self, handle: TimerHandle, kind: TimerKind) {
        match kind {
            TimerKind::TurnoutPulse { addr } => {
                if let Some(command) = self.scheduler.expire(addr, handle) {
                    self.send_logged(command);
                }
            }
            TimerKind::ProgrammingTimeout { request } => {
                let progress = self.correlator.on_timeout(&mut self.timers, request, handle);
                self.apply_progress(progress);
            }
        }
    }

    pub fn client_connected(&mut self, session: SessionId, outbound: mpsc::UnboundedSender<ServerMessage>) {
        info!(%session, "Client connected");
        self.sessions.insert(session, ClientSession::new(session, outbound));
    }

    /// Parses and executes one client message; failures are reported back
    pub fn client_message(&mut self, session: SessionId, text: &str) {
        let result = ClientCommand::parse(text).and_then(|command| self.handle_command(session, command));
        if let Err(err) = result {
            warn!(%session, error = %err, "Client message rejected");
            self.deliver(session, ServerMessage::error(err.to_string()));
        }
    }

    pub fn client_disconnected(&mut self, session: SessionId) {
        let Some(mut client) = self.sessions.remove(&session) else {
            return;
        };
        let was_live = client.close() == SessionState::Live;

        let rejected = self.correlator.close_session(session);
        for request in &rejected {
            info!(%session, cv = request.cv, request = %request.client_request_id, "Programming request dropped, session closed");
        }

        let live_remaining = self.live_sessions();
        info!(
            %session,
            live_remaining,
            dropped_requests = rejected.len(),
            connected_ms = client.age().as_millis() as u64,
            "Client disconnected"
        );
        for command in self.safety.on_session_closed(session, was_live, live_remaining) {
            self.send_logged(command);
        }
    }

    fn handle_command(&mut self, session: SessionId, command: ClientCommand) -> Result<()> {
        if !self.sessions.contains_key(&session) {
            return Err(Error::session(format!("unknown session {}", session)));
        }

        match command {
            ClientCommand::Hello {
                protocol_version,
                client_name,
            } => self.replay(
                session,
                HandshakeInfo {
                    protocol_version,
                    client_name,
                },
            ),
            ClientCommand::Drive {
                addr,
                speed,
                dir,
                steps,
            } => self.send(LanCommand::LocoDrive {
                addr,
                steps,
                direction: dir,
                speed,
                emergency_stop: false,
            }),
            ClientCommand::EmergencyStop { addr } => self.send(LanCommand::LocoEStop { addr }),
            ClientCommand::FunctionSet { addr, function, on } => {
                let action = if on { FunctionAction::On } else { FunctionAction::Off };
                self.send(LanCommand::LocoFunction {
                    addr,
                    function: check_function(function)?,
                    action,
                })
            }
            ClientCommand::FunctionToggle { addr, function } => self.send(LanCommand::LocoFunction {
                addr,
                function: check_function(function)?,
                action: FunctionAction::Toggle,
            }),
            ClientCommand::FunctionGroupSet { addr, group, fns } => {
                let group = FunctionGroup::from_index(group)
                    .ok_or_else(|| Error::protocol(format!("function group {} out of range 1..=6", group)))?;
                let mut functions = FunctionMap::default();
                for (function, on) in group.functions().zip(fns) {
                    functions.set(function, on);
                }
                self.send(LanCommand::LocoFunctionGroup {
                    addr,
                    group,
                    functions,
                })
            }
            ClientCommand::LocoInfoGet { addr } => self.send(LanCommand::GetLocoInfo { addr }),
            ClientCommand::TurnoutSet { addr, state, pulse_ms } => {
                let command = self
                    .scheduler
                    .set(&mut self.timers, addr, state, pulse_ms.map(Duration::from_millis))?;
                self.send(command)
            }
            ClientCommand::TurnoutGet { addr } => self.send(LanCommand::GetTurnoutInfo { addr }),
            ClientCommand::ExtAccessorySet { addr, value } => self.send(LanCommand::SetExtAccessory { addr, value }),
            ClientCommand::ExtAccessoryGet { addr } => self.send(LanCommand::GetExtAccessoryInfo { addr }),
            ClientCommand::TrackPowerSet { on } => self.send(LanCommand::SetTrackPower { on }),
            ClientCommand::Stop {} => self.send(LanCommand::SetStop),
            ClientCommand::StatusGet {} => self.send(LanCommand::GetStatus),
            ClientCommand::VersionGet {} => self.send(LanCommand::GetVersion),
            ClientCommand::FirmwareGet {} => self.send(LanCommand::GetFirmwareVersion),
            ClientCommand::CvRead { request_id, cv, addr } => {
                let cv = check_cv(cv)?;
                let command = match addr {
                    Some(addr) => LanCommand::PomReadByte { addr, cv },
                    None => LanCommand::CvRead { cv },
                };
                self.program(session, request_id, cv, command)
            }
            ClientCommand::CvWrite {
                request_id,
                cv,
                value,
                addr: Some(addr),
            } => {
                // The central never answers a POM write, so this result only
                // confirms the write was sent; it is not a read-back
                self.send(LanCommand::PomWriteByte {
                    addr,
                    cv: check_cv(cv)?,
                    value,
                })?;
                self.deliver(session, ServerMessage::cv_outcome(request_id, cv, Ok(value)));
                Ok(())
            }
            ClientCommand::CvWrite {
                request_id,
                cv,
                value,
                addr: None,
            } => {
                let cv = check_cv(cv)?;
                self.program(session, request_id, cv, LanCommand::CvWrite { cv, value })
            }
        }
    }

    fn program(&mut self, session: SessionId, request_id: Value, cv: u16, command: LanCommand) -> Result<()> {
        let (request, next) = self.correlator.submit(&mut self.timers, session, request_id, cv, command);
        debug!(%session, %request, cv, "Programming request accepted");
        match next {
            Some(command) => self.send(command),
            None => Ok(()),
        }
    }

    /// Sends the cached state followed by the ready marker, then goes live
    fn replay(&mut self, session: SessionId, handshake: HandshakeInfo) -> Result<()> {
        if let Some(version) = handshake.protocol_version.filter(|v| *v != PROTOCOL_VERSION) {
            warn!(%session, client = version, gateway = PROTOCOL_VERSION, "Protocol version mismatch");
        }

        let messages = self.cache.replay();
        let client = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| Error::session(format!("unknown session {}", session)))?;

        info!(%session, client_name = ?handshake.client_name, replayed = messages.len(), "Replaying state");
        client.begin_replay(handshake)?;
        for message in messages {
            client.send(message)?;
        }
        client.send(ServerMessage::SessionReady {
            session_id: session,
            protocol_version: PROTOCOL_VERSION,
        })?;
        client.finish_replay()
    }
}

fn check_cv(cv: u16) -> Result<u16> {
    if (1..=MAX_CV).contains(&cv) {
        Ok(cv)
    } else {
        Err(Error::protocol(format!("CV {} out of range 1..={}", cv, MAX_CV)))
    }
}

fn check_function(function: u8) -> Result<u8> {
    if function < FunctionMap::COUNT {
        Ok(function)
    } else {
        Err(Error::protocol(format!("function F{} out of range F0..=F31", function)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CentralState, Direction, SafetyAction, SafetyTrigger, SpeedSteps, TurnoutState};
    use crate::gateway::timer::ManualTimers;
    use crate::gateway::timer::DelayQueueTimers;
    use crate::protocol::{LanCodec, LocoInfo, SystemState, TrackPowerChange, TurnoutInfo};
    use crate::util::{from_hex, to_hex};
    use serde_json::json;

    struct Harness {
        gateway: Gateway<ManualTimers>,
        central: mpsc::UnboundedReceiver<LanCommand>,
    }

    fn config() -> Config {
        Config::from_json(r#"{"z21": {"host": "127.0.0.1"}}"#).unwrap()
    }

    fn harness_with(config: Config) -> Harness {
        let (tx, central) = mpsc::unbounded_channel();
        Harness {
            gateway: Gateway::new(&config, ManualTimers::new(), tx),
            central,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    impl Harness {
        fn connect(&mut self, id: u64) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.gateway.client_connected(SessionId(id), tx);
            rx
        }

        fn hello(&mut self, id: u64) -> mpsc::UnboundedReceiver<ServerMessage> {
            let rx = self.connect(id);
            self.gateway.client_message(
                SessionId(id),
                r#"{"type":"server.command.session.hello","payload":{"protocolVersion":1,"clientName":"test"}}"#,
            );
            rx
        }

        fn message(&mut self, id: u64, value: serde_json::Value) {
            self.gateway.client_message(SessionId(id), &value.to_string());
        }

        fn inject(&mut self, event: LanEvent) {
            let frame = LanCodec::new().encode_event(&event);
            self.datagram(&to_hex(&frame));
        }

        fn datagram(&mut self, hex: &str) {
            let event = LanCodec::new().decode_datagram(&from_hex(hex).unwrap()).unwrap();
            self.gateway.handle(GatewayEvent::Central(event));
        }

        fn advance(&mut self, by: Duration) {
            for (handle, kind) in self.gateway.timers_mut().advance(by) {
                self.gateway.handle_timer(handle, kind);
            }
        }

        fn sent(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(command) = self.central.try_recv() {
                frames.push(to_hex(&LanCodec::new().encode_command(&command)));
            }
            frames
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn loco(addr: u16, speed: u8) -> LanEvent {
        LanEvent::LocoInfo(LocoInfo {
            addr,
            busy: false,
            steps: SpeedSteps::Steps128,
            direction: Direction::Forward,
            speed,
            emergency_stop: false,
            double_traction: false,
            smart_search: false,
            functions: FunctionMap::default(),
        })
    }

    #[test]
    fn test_client_commands_produce_fixture_frames() {
        let mut h = harness();
        let _rx = h.hello(1);

        h.message(1, json!({"type": "loco.command.drive", "payload": {"addr": 1845, "speed": 47, "dir": "FWD", "steps": 128}}));
        h.message(1, json!({"type": "system.command.trackpower.set", "payload": {"on": true}}));
        h.message(1, json!({"type": "loco.command.eStop", "payload": {"addr": 1845}}));
        h.message(1, json!({"type": "loco.command.function.set", "payload": {"addr": 1845, "fn": 7, "on": true}}));

        assert_eq!(
            h.sent(),
            vec!["0a004000e413c735b0b5", "070040002181a0", "0800400092c73560", "0a004000e4f8c73547a9"]
        );
    }

    #[test]
    fn test_turnout_pulse() {
        let mut h = harness();
        let _rx = h.hello(1);

        h.message(1, json!({"type": "switching.command.turnout.set", "payload": {"addr": 12, "state": "STRAIGHT", "pulseMs": 200}}));
        assert_eq!(h.sent(), vec!["0900400053000ca8f7"]);

        h.advance(Duration::from_millis(199));
        assert!(h.sent().is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(h.sent(), vec!["0900400053000ca0ff"]);
    }

    #[test]
    fn test_superseded_turnout_deactivates_once() {
        let mut h = harness();
        let _rx = h.hello(1);

        h.message(1, json!({"type": "switching.command.turnout.set", "payload": {"addr": 12, "state": "STRAIGHT", "pulseMs": 200}}));
        h.advance(Duration::from_millis(100));
        h.message(1, json!({"type": "switching.command.turnout.set", "payload": {"addr": 12, "state": "DIVERGING", "pulseMs": 200}}));
        h.advance(Duration::from_secs(1));

        // Only the diverging (output 2) pulse is closed
        assert_eq!(
            h.sent(),
            vec!["0900400053000ca8f7", "0900400053000ca9f6", "0900400053000ca1fe"]
        );
    }

    #[test]
    fn test_replay_one_message_per_entity() {
        let mut h = harness();
        for speed in 0..20 {
            h.inject(loco(1845, speed));
            h.inject(loco(3, speed));
        }
        h.datagram("0900400043000c014e");
        h.datagram("0900400043000c024d");
        h.datagram("07004000610160");

        let mut rx = h.hello(7);
        let replay = drain(&mut rx);
        assert_eq!(replay.len(), 5);
        assert!(matches!(replay[0], ServerMessage::LocoState { addr: 3, speed: 19, .. }));
        assert!(matches!(replay[1], ServerMessage::LocoState { addr: 1845, speed: 19, .. }));
        assert_eq!(
            replay[2],
            ServerMessage::TurnoutState {
                addr: 12,
                state: TurnoutState::Diverging
            }
        );
        assert!(matches!(replay[3], ServerMessage::TrackPower { on: true, short: false, .. }));
        assert_eq!(
            replay[4],
            ServerMessage::SessionReady {
                session_id: SessionId(7),
                protocol_version: PROTOCOL_VERSION
            }
        );

        // Live events follow the ready marker
        h.datagram("07004000610061");
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::TrackPower {
                on: false,
                short: false,
                emergency_stop: false,
                programming_mode: false
            }]
        );
    }

    #[test]
    fn test_live_events_wait_for_hello() {
        let mut h = harness();
        let mut pending = h.connect(1);
        let mut live = h.hello(2);
        drain(&mut live);

        h.datagram("0f004000efc735048004000000009d");
        assert!(drain(&mut pending).is_empty());
        let events = drain(&mut live);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerMessage::LocoState { addr: 1845, speed: 0, estop: false, fns, .. } if fns.get(3)));

        // A later hello replays the entity once and then goes live
        h.gateway.client_message(SessionId(1), r#"{"type":"server.command.session.hello"}"#);
        let replay = drain(&mut pending);
        assert_eq!(replay.len(), 2);
        assert!(h.gateway.session(SessionId(1)).unwrap().is_live());
    }

    #[test]
    fn test_cv_read_result_and_late_duplicate() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);
        h.sent();

        h.message(1, json!({"type": "programming.command.cv.read", "payload": {"requestId": "r1", "cv": 29}}));
        assert_eq!(
            h.sent(),
            vec![to_hex(&LanCodec::new().encode_command(&LanCommand::CvRead { cv: 29 }))]
        );

        h.inject(LanEvent::CvResult { cv: 29, value: 6 });
        h.inject(LanEvent::CvResult { cv: 29, value: 6 });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::CvResult {
                request_id: json!("r1"),
                cv: 29,
                cv_value: 6
            }]
        );
    }

    #[test]
    fn test_cv_timeout_and_nack() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        h.message(1, json!({"type": "programming.command.cv.read", "payload": {"requestId": 1, "cv": 1, "addr": 3}}));
        h.message(1, json!({"type": "programming.command.cv.write", "payload": {"requestId": 2, "cv": 8, "value": 8}}));
        assert_eq!(h.gateway.correlator().queued(), 1);

        h.advance(Duration::from_secs(30));
        h.datagram("07004000611372");
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::CvNack {
                    request_id: json!(1),
                    cv: 1,
                    error: "request timed out".to_string()
                },
                ServerMessage::CvNack {
                    request_id: json!(2),
                    cv: 8,
                    error: "decoder did not acknowledge the CV request".to_string()
                },
            ]
        );
        assert_eq!(h.gateway.timers_mut().pending(), 0);
    }

    #[test]
    fn test_pom_write_is_reported_as_sent() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        h.message(1, json!({"type": "programming.command.cv.write", "payload": {"requestId": "w", "cv": 3, "value": 10, "addr": 1845}}));
        assert_eq!(h.sent().len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::CvResult {
                request_id: json!("w"),
                cv: 3,
                cv_value: 10
            }]
        );
        assert_eq!(h.gateway.correlator().in_flight(), None);
    }

    #[test]
    fn test_disconnect_rejects_programming_and_stops() {
        let mut config = config();
        config.safety.stop_all_on_client_disconnect = true;
        config.safety.trigger = SafetyTrigger::LastSession;
        config.safety.action = SafetyAction::Both;
        let mut h = harness_with(config);

        let _a = h.hello(1);
        let _b = h.hello(2);
        h.message(1, json!({"type": "programming.command.cv.read", "payload": {"requestId": 1, "cv": 1}}));
        h.sent();

        h.gateway.client_disconnected(SessionId(1));
        assert_eq!(h.gateway.correlator().pending_for(SessionId(1)), 0);
        assert!(h.sent().is_empty());

        h.gateway.client_disconnected(SessionId(2));
        assert_eq!(h.sent(), vec!["060040008080", "070040002180a1"]);
        assert_eq!(h.gateway.live_sessions(), 0);
    }

    #[test]
    fn test_unknown_frames_are_forwarded() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        h.datagram("07004000615534");
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Unknown {
                raw: "07004000615534".to_string()
            }]
        );
    }

    #[test]
    fn test_oversized_pulse_is_rejected() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        h.message(1, json!({"type": "switching.command.turnout.set", "addr": 5, "state": "STRAIGHT", "pulseMs": 100_000_000_000u64}));
        assert!(matches!(drain(&mut rx).as_slice(), [ServerMessage::Error { .. }]));
        assert!(h.sent().is_empty());
        assert_eq!(h.gateway.scheduler().pending(), 0);
        assert_eq!(h.gateway.timers_mut().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_pulse_keeps_delay_queue_alive() {
        let (tx, mut central) = mpsc::unbounded_channel();
        let mut gateway = Gateway::new(&config(), DelayQueueTimers::new(), tx);
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        gateway.client_connected(SessionId(1), client_tx);

        gateway.client_message(
            SessionId(1),
            r#"{"type":"switching.command.turnout.set","addr":5,"state":"STRAIGHT","pulseMs":100000000000}"#,
        );
        assert!(matches!(client_rx.try_recv(), Ok(ServerMessage::Error { .. })));
        assert!(central.try_recv().is_err());
        assert!(gateway.timers_mut().is_empty());

        gateway.client_message(
            SessionId(1),
            r#"{"type":"switching.command.turnout.set","addr":5,"state":"STRAIGHT","pulseMs":10000}"#,
        );
        assert!(central.try_recv().is_ok());
        let (handle, kind) = gateway.timers_mut().expired().await;
        gateway.handle_timer(handle, kind);
        assert_eq!(
            central.try_recv().ok(),
            Some(LanCommand::SetTurnout {
                addr: 5,
                output: TurnoutState::Straight,
                activate: false,
                queue: true
            })
        );
    }

    #[test]
    fn test_rejected_messages_get_error_reply() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        h.gateway.client_message(SessionId(1), "{not json");
        h.message(1, json!({"type": "loco.command.function.set", "payload": {"addr": 3, "fn": 40, "on": true}}));
        h.message(1, json!({"type": "programming.command.cv.read", "payload": {"requestId": 1, "cv": 0}}));
        h.message(1, json!({"type": "switching.command.turnout.set", "payload": {"addr": 1, "state": "UNKNOWN"}}));

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|m| matches!(m, ServerMessage::Error { .. })));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_system_state_updates_track_power() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);

        let state = SystemState {
            central_state: CentralState(CentralState::EMERGENCY_STOP),
            ..SystemState::default()
        };
        h.inject(LanEvent::SystemState(state));
        let messages = drain(&mut rx);
        assert_eq!(messages[0], ServerMessage::SystemState(state));
        assert_eq!(
            messages[1],
            ServerMessage::TrackPower {
                on: true,
                short: false,
                emergency_stop: true,
                programming_mode: false
            }
        );

        // Same state again does not repeat the track power message
        h.inject(LanEvent::SystemState(state));
        assert_eq!(drain(&mut rx).len(), 1);

        h.inject(LanEvent::TrackPower(TrackPowerChange::ShortCircuit));
        let messages = drain(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [ServerMessage::TrackPower { short: true, on: false, .. }]
        ));
    }

    #[test]
    fn test_turnout_info_is_forwarded() {
        let mut h = harness();
        let mut rx = h.hello(1);
        drain(&mut rx);
        h.inject(LanEvent::TurnoutInfo(TurnoutInfo {
            addr: 12,
            state: TurnoutState::Straight,
        }));
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::TurnoutState {
                addr: 12,
                state: TurnoutState::Straight
            }]
        );
    }

    #[test]
    fn test_startup_and_shutdown_frames() {
        let mut h = harness();
        h.gateway.startup().unwrap();
        let frames = h.sent();
        assert_eq!(frames.len(), 7);
        assert_eq!(frames[0], "0800500001010100");
        assert_eq!(frames[1], "04001000");
        assert_eq!(frames[6], "04008500");

        h.gateway.heartbeat().unwrap();
        assert_eq!(h.sent(), vec!["04008500"]);

        let _rx = h.hello(1);
        h.message(1, json!({"type": "switching.command.turnout.set", "payload": {"addr": 12, "state": "STRAIGHT"}}));
        h.sent();
        h.gateway.shutdown().unwrap();
        assert_eq!(h.sent(), vec!["0900400053000ca0ff", "04003000"]);
    }
}
