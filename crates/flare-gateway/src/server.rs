//! Gateway listener and process lifecycle.
//!
//! Binds the WebSocket listener, spawns one endpoint task per accepted
//! transport, and owns the session directory. Shutdown is cooperative:
//! the accept loop stops first, then every live session broadcasts
//! `session_ended{shutdown}` and the endpoints wind down as their queues
//! close.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flare_core::{CredentialVerifier, EndReason, SessionStore};
use flare_session::SessionDirectory;

use crate::attachment::{AttachmentContext, AttachmentSettings, run_attachment};
use crate::config::GatewayConfig;
use crate::error::GatewayResult;

/// The gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Bind the configured listener and start accepting attachments.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation or the
    /// listener cannot bind.
    pub async fn start(
        config: GatewayConfig,
        store: Arc<dyn SessionStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> GatewayResult<ServerHandle> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let directory = SessionDirectory::new(store, config.session_limits());
        let ctx = AttachmentContext {
            directory: Arc::clone(&directory),
            verifier,
            settings: AttachmentSettings {
                outbound_queue: config.limits.outbound_queue,
                inbound_rate: config.attachment.inbound_rate,
                write_deadline: config.write_deadline(),
            },
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
        info!(addr = %local_addr, "Gateway listening");

        Ok(ServerHandle {
            local_addr,
            directory,
            shutdown_tx,
            accept_task,
        })
    }
}

/// Handle to a running gateway.
pub struct ServerHandle {
    local_addr: SocketAddr,
    directory: Arc<SessionDirectory>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the listener actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The process-wide session directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Stop accepting, end every live session with
    /// `session_ended{shutdown}`, and wait for the accept loop to finish.
    pub async fn shutdown(self) {
        info!("Gateway shutting down");
        let _ = self.shutdown_tx.send(());
        self.directory.end_all(EndReason::Shutdown).await;
        if self.accept_task.await.is_err() {
            warn!("Accept loop ended abnormally");
        }
        info!("Gateway stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: AttachmentContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Transport accepted");
                    tokio::spawn(run_attachment(stream, peer, ctx.clone()));
                },
                Err(err) => warn!(error = %err, "Accept failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::store::MemorySessionStore;
    use flare_core::{
        ClientFrame, ErrorCode, ParticipantProfile, ServerFrame, SessionId,
    };
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    // ── Helpers ──────────────────────────────────────────────

    async fn start_gateway() -> (ServerHandle, Arc<MemorySessionStore>, Arc<StaticTokenVerifier>) {
        let config = GatewayConfig {
            gateway: crate::config::GatewaySettings {
                listen_addr: "127.0.0.1:0".into(),
            },
            ..GatewayConfig::default()
        };
        let store = Arc::new(MemorySessionStore::new());
        let verifier = Arc::new(StaticTokenVerifier::new());
        let server = GatewayServer::start(config, store.clone(), verifier.clone())
            .await
            .expect("gateway failed to start");
        (server, store, verifier)
    }

    fn profile(name: &str) -> ParticipantProfile {
        ParticipantProfile::new(name, "#4488cc").unwrap()
    }

    async fn connect(addr: SocketAddr, token: &str) -> WsClient {
        let (ws, _response) = connect_async(format!("ws://{addr}/attach?token={token}"))
            .await
            .expect("connect failed");
        ws
    }

    /// Next decoded server frame; `None` once the connection closes.
    async fn recv_frame(ws: &mut WsClient) -> Option<ServerFrame> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")?;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(ServerFrame::decode(&text).expect("undecodable frame"));
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {},
            }
        }
    }

    async fn drain_initials(ws: &mut WsClient) {
        assert!(matches!(
            recv_frame(ws).await,
            Some(ServerFrame::InitialParticipants { .. })
        ));
        assert!(matches!(
            recv_frame(ws).await,
            Some(ServerFrame::InitialLocations { .. })
        ));
    }

    async fn send(ws: &mut WsClient, frame: &ClientFrame) {
        ws.send(Message::Text(frame.encode())).await.unwrap();
    }

    fn update_frame(offset_secs: i64) -> ClientFrame {
        let base: chrono::DateTime<chrono::Utc> = "2025-01-15T10:30:00Z".parse().unwrap();
        ClientFrame::LocationUpdate {
            lat: 37.7749,
            lng: -122.4194,
            accuracy: 5.0,
            timestamp: base
                .checked_add_signed(chrono::TimeDelta::seconds(offset_secs))
                .unwrap(),
            speed: None,
            heading: None,
            altitude: None,
        }
    }

    // ── End-to-end scenarios ─────────────────────────────────

    #[tokio::test]
    async fn attach_snapshot_broadcast_and_no_echo() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token_a = verifier.issue(session, "alice".into(), profile("Alice"));
        let token_b = verifier.issue(session, "bob".into(), profile("Bob"));

        let mut alice = connect(server.local_addr(), &token_a).await;
        match recv_frame(&mut alice).await {
            Some(ServerFrame::InitialParticipants { participants }) => {
                assert!(participants.is_empty());
            },
            other => panic!("expected initial_participants, got {other:?}"),
        }
        assert!(matches!(
            recv_frame(&mut alice).await,
            Some(ServerFrame::InitialLocations { locations }) if locations.is_empty()
        ));

        let mut bob = connect(server.local_addr(), &token_b).await;
        match recv_frame(&mut bob).await {
            Some(ServerFrame::InitialParticipants { participants }) => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].participant_id, "alice".into());
                assert_eq!(participants[0].display_name, "Alice");
                assert!(participants[0].is_active);
            },
            other => panic!("expected initial_participants, got {other:?}"),
        }
        assert!(matches!(
            recv_frame(&mut bob).await,
            Some(ServerFrame::InitialLocations { .. })
        ));

        // Alice learns about Bob before anything Bob sends.
        assert!(matches!(
            recv_frame(&mut alice).await,
            Some(ServerFrame::ParticipantJoined { participant_id, .. })
                if participant_id == "bob".into()
        ));

        send(&mut alice, &update_frame(0)).await;
        match recv_frame(&mut bob).await {
            Some(ServerFrame::LocationUpdate {
                participant_id,
                lat,
                lng,
                accuracy,
                ..
            }) => {
                assert_eq!(participant_id, "alice".into());
                assert!((lat - 37.7749).abs() < f64::EPSILON);
                assert!((lng + 122.4194).abs() < f64::EPSILON);
                assert!((accuracy - 5.0).abs() < f64::EPSILON);
            },
            other => panic!("expected location_update, got {other:?}"),
        }

        // No self-echo: the next frame Alice sees is the pong for her ping.
        send(&mut alice, &ClientFrame::Ping).await;
        assert_eq!(recv_frame(&mut alice).await, Some(ServerFrame::Pong));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_token_is_rejected_and_closed() {
        let (server, _store, _verifier) = start_gateway().await;
        let mut ws = connect(server.local_addr(), "bogus").await;
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::Error {
                code: ErrorCode::Unauthorized,
                ..
            })
        ));
        assert_eq!(recv_frame(&mut ws).await, None);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn missing_token_is_rejected_and_closed() {
        let (server, _store, _verifier) = start_gateway().await;
        let (mut ws, _response) =
            connect_async(format!("ws://{}/attach", server.local_addr()))
                .await
                .unwrap();
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::Error {
                code: ErrorCode::Unauthorized,
                ..
            })
        ));
        assert_eq!(recv_frame(&mut ws).await, None);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn token_for_unknown_session_is_rejected() {
        let (server, _store, verifier) = start_gateway().await;
        let token = verifier.issue(SessionId::new(), "ghost".into(), profile("Ghost"));
        let mut ws = connect(server.local_addr(), &token).await;
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::Error {
                code: ErrorCode::SessionNotFound,
                ..
            })
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn ended_session_refuses_new_attachments() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        store.end_session(session);
        let token = verifier.issue(session, "late".into(), profile("Late"));

        let mut ws = connect(server.local_addr(), &token).await;
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::SessionEnded { .. })
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_frames_are_answered_but_not_fatal() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token = verifier.issue(session, "alice".into(), profile("Alice"));

        let mut ws = connect(server.local_addr(), &token).await;
        drain_initials(&mut ws).await;

        // Out-of-range latitude: error frame, no broadcast, no disconnect.
        let bad = ClientFrame::LocationUpdate {
            lat: 123.0,
            lng: 0.0,
            accuracy: 1.0,
            timestamp: "2025-01-15T10:30:00Z".parse().unwrap(),
            speed: None,
            heading: None,
            altitude: None,
        };
        send(&mut ws, &bad).await;
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::Error {
                code: ErrorCode::InvalidLocation,
                ..
            })
        ));

        // Not even JSON: same story.
        ws.send(Message::Text("not a frame".into())).await.unwrap();
        assert!(matches!(
            recv_frame(&mut ws).await,
            Some(ServerFrame::Error {
                code: ErrorCode::InvalidFrame,
                ..
            })
        ));

        // The connection still works.
        send(&mut ws, &ClientFrame::Ping).await;
        assert_eq!(recv_frame(&mut ws).await, Some(ServerFrame::Pong));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_protocol_errors_remove_the_participant() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token_a = verifier.issue(session, "alice".into(), profile("Alice"));
        let token_b = verifier.issue(session, "bob".into(), profile("Bob"));

        let mut alice = connect(server.local_addr(), &token_a).await;
        drain_initials(&mut alice).await;
        let mut bob = connect(server.local_addr(), &token_b).await;
        drain_initials(&mut bob).await;
        assert!(matches!(
            recv_frame(&mut alice).await,
            Some(ServerFrame::ParticipantJoined { .. })
        ));

        for _ in 0..5 {
            alice.send(Message::Text("garbage".into())).await.unwrap();
        }

        // Bob observes the removal; Alice's connection dies after the
        // error replies.
        assert!(matches!(
            recv_frame(&mut bob).await,
            Some(ServerFrame::ParticipantLeft { participant_id, .. })
                if participant_id == "alice".into()
        ));
        let mut saw_close = false;
        for _ in 0..8 {
            match recv_frame(&mut alice).await {
                Some(ServerFrame::Error { .. }) => {},
                None => {
                    saw_close = true;
                    break;
                },
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_close, "alice was not disconnected");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn host_ending_the_session_reaches_every_client() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token_a = verifier.issue(session, "alice".into(), profile("Alice"));
        let token_b = verifier.issue(session, "bob".into(), profile("Bob"));

        let mut alice = connect(server.local_addr(), &token_a).await;
        let mut bob = connect(server.local_addr(), &token_b).await;
        drain_initials(&mut alice).await;
        drain_initials(&mut bob).await;

        let handle = server.directory().lookup(session).expect("session is live");
        handle.end(flare_core::EndReason::EndedByCreator).await;
        handle.closed().await;

        for ws in [&mut alice, &mut bob] {
            let mut last = None;
            while let Some(frame) = recv_frame(ws).await {
                last = Some(frame);
            }
            assert_eq!(
                last,
                Some(ServerFrame::SessionEnded {
                    reason: flare_core::EndReason::EndedByCreator
                })
            );
        }
        assert!(server.directory().lookup(session).is_none());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_sends_session_ended_to_live_clients() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token = verifier.issue(session, "alice".into(), profile("Alice"));

        let mut ws = connect(server.local_addr(), &token).await;
        drain_initials(&mut ws).await;

        server.shutdown().await;

        let mut last = None;
        while let Some(frame) = recv_frame(&mut ws).await {
            last = Some(frame);
        }
        assert_eq!(
            last,
            Some(ServerFrame::SessionEnded {
                reason: flare_core::EndReason::Shutdown
            })
        );
    }

    #[tokio::test]
    async fn reconnect_supersedes_the_first_attachment() {
        let (server, store, verifier) = start_gateway().await;
        let session = store.create_session(None, Duration::from_secs(3600));
        let token = verifier.issue(session, "alice".into(), profile("Alice"));

        let mut first = connect(server.local_addr(), &token).await;
        drain_initials(&mut first).await;

        let mut second = connect(server.local_addr(), &token).await;
        drain_initials(&mut second).await;

        assert_eq!(
            recv_frame(&mut first).await,
            Some(ServerFrame::SessionEnded {
                reason: flare_core::EndReason::Superseded
            })
        );
        assert_eq!(recv_frame(&mut first).await, None);

        // The surviving attachment still works.
        send(&mut second, &ClientFrame::Ping).await;
        assert_eq!(recv_frame(&mut second).await, Some(ServerFrame::Pong));

        server.shutdown().await;
    }
}
