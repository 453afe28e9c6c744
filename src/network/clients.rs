use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::core::{Error, Result, SessionId};
use crate::gateway::GatewayEvent;

/// Accepts WebSocket clients and turns them into gateway events
pub struct ClientListener {
    listener: TcpListener,
}

impl ClientListener {
    /// Binds the TCP listener
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::network(format!("Failed to bind client listener on {}: {}", addr, e)))?;
        Ok(ClientListener { listener })
    }

    /// Returns the local listener address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to get local address: {}", e)))
    }

    /// Starts the accept loop; each client gets its own task
    pub fn spawn(self, events: mpsc::UnboundedSender<GatewayEvent>, heartbeat: Duration) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(events, heartbeat))
    }

    async fn run(self, events: mpsc::UnboundedSender<GatewayEvent>, heartbeat: Duration) -> Result<()> {
        info!(addr = %self.local_addr()?, "Accepting WebSocket clients");
        let mut next_session = 1;

        while !events.is_closed() {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client");
                    continue;
                }
            };

            let session = SessionId(next_session);
            next_session += 1;

            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, peer, session, events, heartbeat).await {
                    debug!(%session, %peer, error = %e, "Client connection ended with error");
                }
            });
        }

        Ok(())
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::network(format!("WebSocket error: {}", e))
}

/// Runs one client connection until either side goes away
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    session: SessionId,
    events: mpsc::UnboundedSender<GatewayEvent>,
    heartbeat: Duration,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let websocket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::network(format!("WebSocket handshake with {} failed: {}", peer, e)))?;
    let (mut sink, mut frames) = websocket.split();

    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    events
        .send(GatewayEvent::ClientConnected {
            session,
            outbound: outbound_tx,
        })
        .map_err(|_| Error::network("gateway is not running"))?;
    info!(%session, %peer, "WebSocket client connected");

    let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);

    let result = loop {
        tokio::select! {
            message = outbound.recv() => {
                // The gateway dropped the session
                let Some(message) = message else { break Ok(()) };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%session, error = %e, "Failed to serialize message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    break Err(ws_error(e));
                }
            }

            frame = frames.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(%session, "Ignoring binary frame that is not UTF-8");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    // tungstenite answers pings itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(ws_error(e)),
                };
                if events.send(GatewayEvent::ClientMessage { session, text }).is_err() {
                    break Ok(());
                }
            }

            _ = ping.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    break Err(ws_error(e));
                }
            }
        }
    };

    let _ = events.send(GatewayEvent::ClientDisconnected { session });
    let _ = sink.close().await;
    info!(%session, %peer, "WebSocket client disconnected");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_client_lifecycle() {
        let listener = ClientListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let task = listener.spawn(events_tx, Duration::from_secs(60));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();

        let (session, outbound) = match next_event(&mut events_rx).await {
            GatewayEvent::ClientConnected { session, outbound } => (session, outbound),
            other => panic!("Expected connect, got {:?}", other),
        };
        assert_eq!(session, SessionId(1));

        client
            .send(WsMessage::Text(r#"{"type":"system.command.stop"}"#.to_string()))
            .await
            .unwrap();
        match next_event(&mut events_rx).await {
            GatewayEvent::ClientMessage { session: from, text } => {
                assert_eq!(from, session);
                assert_eq!(text, r#"{"type":"system.command.stop"}"#);
            }
            other => panic!("Expected message, got {:?}", other),
        }

        outbound.send(ServerMessage::error("nope")).unwrap();
        let frame = timeout(Duration::from_secs(5), client.next()).await.unwrap().unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "server.replay.error");
        assert_eq!(value["payload"]["message"], "nope");

        client.close(None).await.unwrap();
        assert!(matches!(
            next_event(&mut events_rx).await,
            GatewayEvent::ClientDisconnected { session: closed } if closed == session
        ));

        task.abort();
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_ids() {
        let listener = ClientListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let task = listener.spawn(events_tx, Duration::from_secs(60));

        let mut ids = Vec::new();
        let mut clients = Vec::new();
        let mut senders = Vec::new();
        for _ in 0..3 {
            let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
            clients.push(client);
            match next_event(&mut events_rx).await {
                GatewayEvent::ClientConnected { session, outbound } => {
                    ids.push(session);
                    senders.push(outbound);
                }
                other => panic!("Expected connect, got {:?}", other),
            }
        }
        assert_eq!(ids, vec![SessionId(1), SessionId(2), SessionId(3)]);

        task.abort();
    }
}
