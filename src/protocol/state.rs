use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::core::{Error, Result, SessionId};
use super::message::ServerMessage;

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, no hello received yet
    Connecting,
    /// Cached state is being sent
    Replaying,
    /// Receives live events
    Live,
    /// Transport closed; nothing is delivered any more
    Closed,
}

/// What the client told us in its hello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: Option<u32>,
    pub client_name: Option<String>,
}

/// One connected client as seen by the gateway
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    state: SessionState,
    handshake: Option<HandshakeInfo>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    connected_at: Instant,
}

impl ClientSession {
    /// Creates a session in the `Connecting` state
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        ClientSession {
            id,
            state: SessionState::Connecting,
            handshake: None,
            outbound,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.handshake.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    /// Time since the transport connected
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Enters `Replaying`; a repeated hello from a live session replays again
    pub fn begin_replay(&mut self, handshake: HandshakeInfo) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Live => {
                self.handshake = Some(handshake);
                self.state = SessionState::Replaying;
                Ok(())
            }
            other => Err(Error::invalid_state(format!(
                "session {} cannot start a replay while {:?}",
                self.id, other
            ))),
        }
    }

    /// Leaves `Replaying` for `Live`
    pub fn finish_replay(&mut self) -> Result<()> {
        if self.state != SessionState::Replaying {
            return Err(Error::invalid_state(format!(
                "session {} is not replaying ({:?})",
                self.id, self.state
            )));
        }
        self.state = SessionState::Live;
        Ok(())
    }

    /// Moves to `Closed`; returns the state the session was in
    pub fn close(&mut self) -> SessionState {
        std::mem::replace(&mut self.state, SessionState::Closed)
    }

    /// Queues a message for the client's transport task
    pub fn send(&self, message: ServerMessage) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::session(format!("session {} is closed", self.id)));
        }
        self.outbound
            .send(message)
            .map_err(|_| Error::session(format!("session {} outbound channel closed", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ClientSession, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSession::new(SessionId(1), tx), rx)
    }

    #[test]
    fn test_handshake_transitions() {
        let (mut session, _rx) = session();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.finish_replay().is_err());

        session.begin_replay(HandshakeInfo::default()).unwrap();
        assert_eq!(session.state(), SessionState::Replaying);
        assert!(session.begin_replay(HandshakeInfo::default()).is_err());

        session.finish_replay().unwrap();
        assert!(session.is_live());

        // Second hello replays again
        let info = HandshakeInfo {
            protocol_version: Some(1),
            client_name: Some("throttle".to_string()),
        };
        session.begin_replay(info.clone()).unwrap();
        assert_eq!(session.handshake(), Some(&info));
    }

    #[test]
    fn test_closed_session_rejects_everything() {
        let (mut session, mut rx) = session();
        session.send(ServerMessage::error("first")).unwrap();
        assert_eq!(session.close(), SessionState::Connecting);
        assert_eq!(session.close(), SessionState::Closed);

        assert!(session.send(ServerMessage::error("second")).is_err());
        assert!(session.begin_replay(HandshakeInfo::default()).is_err());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::error("first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_fails_when_transport_gone() {
        let (session, rx) = session();
        drop(rx);
        assert!(matches!(session.send(ServerMessage::error("x")), Err(Error::Session(_))));
    }
}
