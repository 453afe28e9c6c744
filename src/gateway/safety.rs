use tracing::warn;

use crate::core::{SafetyAction, SafetyConfig, SafetyTrigger, SessionId};
use crate::protocol::LanCommand;

/// Stops the layout when supervising clients disappear
#[derive(Debug, Clone)]
pub struct SafetySupervisor {
    config: SafetyConfig,
}

impl SafetySupervisor {
    pub fn new(config: SafetyConfig) -> Self {
        SafetySupervisor { config }
    }

    /// Commands to send after `session` closed
    ///
    /// Only sessions that completed their handshake count; `live_remaining`
    /// is the number of live sessions left after the close.
    pub fn on_session_closed(&self, session: SessionId, was_live: bool, live_remaining: usize) -> Vec<LanCommand> {
        if !self.config.stop_all_on_client_disconnect || !was_live {
            return Vec::new();
        }

        let triggered = match self.config.trigger {
            SafetyTrigger::LastSession => live_remaining == 0,
            SafetyTrigger::AnySession => true,
        };
        if !triggered {
            return Vec::new();
        }

        warn!(%session, live_remaining, action = ?self.config.action, "Client gone, stopping the layout");
        match self.config.action {
            SafetyAction::EmergencyStop => vec![LanCommand::SetStop],
            SafetyAction::TrackPowerOff => vec![LanCommand::SetTrackPower { on: false }],
            SafetyAction::Both => vec![LanCommand::SetStop, LanCommand::SetTrackPower { on: false }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(enabled: bool, trigger: SafetyTrigger, action: SafetyAction) -> SafetySupervisor {
        SafetySupervisor::new(SafetyConfig {
            stop_all_on_client_disconnect: enabled,
            trigger,
            action,
        })
    }

    #[test]
    fn test_disabled_does_nothing() {
        let s = supervisor(false, SafetyTrigger::AnySession, SafetyAction::Both);
        assert!(s.on_session_closed(SessionId(1), true, 0).is_empty());
    }

    #[test]
    fn test_last_session_trigger() {
        let s = supervisor(true, SafetyTrigger::LastSession, SafetyAction::EmergencyStop);
        assert!(s.on_session_closed(SessionId(1), true, 1).is_empty());
        assert_eq!(s.on_session_closed(SessionId(2), true, 0), vec![LanCommand::SetStop]);
        // A client that never finished its handshake never supervised anything
        assert!(s.on_session_closed(SessionId(3), false, 0).is_empty());
    }

    #[test]
    fn test_any_session_trigger() {
        let s = supervisor(true, SafetyTrigger::AnySession, SafetyAction::Both);
        assert_eq!(
            s.on_session_closed(SessionId(1), true, 3),
            vec![LanCommand::SetStop, LanCommand::SetTrackPower { on: false }]
        );

        let s = supervisor(true, SafetyTrigger::AnySession, SafetyAction::TrackPowerOff);
        assert_eq!(
            s.on_session_closed(SessionId(1), true, 3),
            vec![LanCommand::SetTrackPower { on: false }]
        );
    }
}
