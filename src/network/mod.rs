//! Network transports and the gateway event loop
//!
//! The central link and the client listener run as their own tasks and feed
//! [`GatewayEvent`]s into one channel. [`GatewayServer`] drains that channel,
//! the timer queue and the heartbeat ticker from a single task.

mod clients;
mod connection;

pub use self::clients::ClientListener;
pub use self::connection::CentralLink;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::core::{Config, Error, Result};
use crate::gateway::{DelayQueueTimers, Gateway, GatewayEvent};
use crate::protocol::LanCommand;

/// How long the central link may take to flush the logoff on shutdown
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// The running gateway: transports plus the event loop that owns all state
pub struct GatewayServer {
    gateway: Gateway<DelayQueueTimers>,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    central: JoinHandle<Result<()>>,
    clients: JoinHandle<Result<()>>,
    client_addr: SocketAddr,
    heartbeat: Duration,
}

impl GatewayServer {
    /// Opens the central link and the client listener
    pub async fn bind(config: &Config, heartbeat: Duration) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (central_tx, central_rx) = mpsc::unbounded_channel::<LanCommand>();

        let link = CentralLink::connect(&config.z21).await?;
        let listener = ClientListener::bind((Ipv4Addr::UNSPECIFIED, config.http_port).into()).await?;
        let client_addr = listener.local_addr()?;

        let central = link.spawn(events_tx.clone(), central_rx);
        let clients = listener.spawn(events_tx, heartbeat);

        Ok(GatewayServer {
            gateway: Gateway::new(config, DelayQueueTimers::new(), central_tx),
            events,
            central,
            clients,
            client_addr,
            heartbeat,
        })
    }

    /// Address WebSocket clients connect to
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Runs the event loop until `shutdown` completes, then logs off
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let GatewayServer {
            mut gateway,
            mut events,
            central,
            clients,
            heartbeat,
            ..
        } = self;

        gateway.startup()?;

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => gateway.handle(event),
                    None => {
                        warn!("All transports stopped");
                        break;
                    }
                },

                (handle, kind) = gateway.timers_mut().expired() => gateway.handle_timer(handle, kind),

                _ = ticker.tick() => {
                    if let Err(e) = gateway.heartbeat() {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        clients.abort();
        let result = gateway.shutdown();

        // Dropping the gateway closes the outbound queue; the link drains it and exits
        drop(gateway);
        match timeout(SHUTDOWN_FLUSH, central).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Central link failed"),
            Ok(Err(e)) => warn!(error = %e, "Central link task panicked"),
            Err(_) => warn!("Central link did not flush in time"),
        }

        result.map_err(|e| Error::network(format!("Failed to log off: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, Stream, StreamExt};
    use serde_json::Value;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::util::{from_hex, to_hex};

    const WAIT: Duration = Duration::from_secs(5);

    async fn recv_frame(central: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = [0u8; 256];
        let (len, from) = timeout(WAIT, central.recv_from(&mut buf)).await.unwrap().unwrap();
        (to_hex(&buf[..len]), from)
    }

    async fn recv_json<S>(client: &mut S) -> Value
    where
        S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_gateway_end_to_end() {
        let central = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config::from_json(&format!(
            r#"{{"httpPort": 0, "z21": {{"host": "127.0.0.1", "udpPort": {}}}}}"#,
            central.local_addr().unwrap().port()
        ))
        .unwrap();

        let server = GatewayServer::bind(&config, Duration::from_secs(60)).await.unwrap();
        let port = server.client_addr().port();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // Startup burst: broadcast subscription first, system state poll last
        let (first, link) = recv_frame(&central).await;
        assert_eq!(first, "0800500001010100");
        for _ in 0..5 {
            recv_frame(&central).await;
        }
        assert_eq!(recv_frame(&central).await.0, "04008500");

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port))
            .await
            .unwrap();
        client
            .send(WsMessage::Text(
                r#"{"type":"server.command.session.hello","payload":{"protocolVersion":1,"clientName":"e2e"}}"#.to_string(),
            ))
            .await
            .unwrap();
        loop {
            let message = recv_json(&mut client).await;
            if message["type"] == "server.replay.session.ready" {
                assert_eq!(message["payload"]["protocolVersion"], 1);
                break;
            }
        }

        // Live event from the central reaches the client
        central
            .send_to(&from_hex("0f004000efc735048004000000009d").unwrap(), link)
            .await
            .unwrap();
        let state = recv_json(&mut client).await;
        assert_eq!(state["type"], "loco.message.state");
        assert_eq!(state["payload"]["addr"], 1845);
        assert_eq!(state["payload"]["fns"][3], true);

        // Client command reaches the central
        client
            .send(WsMessage::Text(
                r#"{"type":"loco.command.drive","addr":1845,"speed":47,"dir":"FWD","steps":128}"#.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(recv_frame(&central).await.0, "0a004000e413c735b0b5");

        stop_tx.send(()).unwrap();
        assert_eq!(recv_frame(&central).await.0, "04003000");
        assert!(timeout(WAIT, running).await.unwrap().unwrap().is_ok());
    }
}
