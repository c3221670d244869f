//! Per-client attachment endpoint.
//!
//! One endpoint task per accepted transport. Lifecycle: handshake (token on
//! the upgrade query), bind (directory lookup + coordinator attach), run
//! (reader relays inbound frames, writer drains the outbound queue under a
//! write deadline), teardown (detach exactly once, whatever the exit path).
//!
//! The reader never blocks on the session: inbound work is handed to the
//! coordinator mailbox and excess inbound traffic is answered with a
//! non-fatal `error` frame. The writer never blocks on the client: a write
//! that misses the deadline declares the transport dead.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, info, warn};

use flare_core::{
    ClientFrame, CredentialVerifier, EndReason, ErrorCode, LeaveReason, LocationRecord,
    ParticipantId, ServerFrame, VerifiedCredential,
};
use flare_session::{
    CoordinatorHandle, OutboundReceiver, OutboundSender, SessionDirectory, SessionError,
    outbound_queue,
};

use crate::auth::token_from_query;
use crate::error::{GatewayError, GatewayResult};

/// Force-detach after this many protocol errors within the window.
const PROTOCOL_ERROR_THRESHOLD: usize = 5;

/// Window over which protocol errors are counted.
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// How long the WebSocket handshake may take before the socket is dropped.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<TcpStream>;

/// Transport bounds handed to every endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttachmentSettings {
    /// Outbound queue capacity, in frames.
    pub(crate) outbound_queue: usize,
    /// Maximum inbound messages per second.
    pub(crate) inbound_rate: u32,
    /// Per-write transport deadline.
    pub(crate) write_deadline: Duration,
}

/// Everything an endpoint needs besides its transport.
#[derive(Clone)]
pub(crate) struct AttachmentContext {
    pub(crate) directory: Arc<SessionDirectory>,
    pub(crate) verifier: Arc<dyn CredentialVerifier>,
    pub(crate) settings: AttachmentSettings,
}

/// Why the endpoint's read side finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// The client closed, errored, or vanished.
    TransportClosed,
    /// The session is over or the writer finished first.
    SessionOver,
    /// The participant crossed the protocol-error threshold.
    ProtocolKick,
}

/// Drive one client transport from handshake to teardown.
pub(crate) async fn run_attachment(stream: TcpStream, peer: SocketAddr, ctx: AttachmentContext) {
    let mut token = None;
    let handshake =
        tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            token = token_from_query(request.uri().query());
            Ok(response)
        });
    let mut ws = match tokio::time::timeout(HANDSHAKE_DEADLINE, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            debug!(%peer, error = %err, "WebSocket handshake failed");
            return;
        },
        Err(_) => {
            debug!(%peer, "WebSocket handshake timed out");
            return;
        },
    };

    // Handshake: the credential decides which (session, participant) this
    // transport speaks for. No data frame is processed before this.
    let credential = match authorize(token.as_deref(), &ctx).await {
        Ok(credential) => credential,
        Err(frame) => {
            debug!(%peer, "Attachment rejected during handshake");
            reject(&mut ws, &frame).await;
            return;
        },
    };
    let VerifiedCredential {
        session_id,
        participant_id,
        profile,
    } = credential;

    // Bind: resolve the coordinator and register the outbound queue.
    let handle = match ctx.directory.get_or_start(session_id).await {
        Ok(handle) => handle,
        Err(err) => {
            debug!(%peer, session = %session_id, error = %err, "Session resolution failed");
            reject(&mut ws, &rejection_frame(&err)).await;
            return;
        },
    };
    let (queue_tx, queue_rx) = outbound_queue(ctx.settings.outbound_queue);
    let local = queue_tx.clone();
    let epoch = match handle
        .attach(participant_id.clone(), profile, queue_tx)
        .await
    {
        Ok(epoch) => epoch,
        Err(err) => {
            debug!(%peer, session = %session_id, error = %err, "Attach refused");
            reject(&mut ws, &rejection_frame(&err)).await;
            return;
        },
    };
    info!(
        %peer,
        session = %session_id,
        participant = %participant_id,
        "Attachment established"
    );

    // Run: reader here, writer as its own task so a slow client write can
    // never block frame ingestion.
    let (sink, stream) = ws.split();
    let mut writer = tokio::spawn(write_loop(sink, queue_rx, ctx.settings.write_deadline));
    let outcome = read_loop(
        stream,
        &mut writer,
        &handle,
        &participant_id,
        &ctx.settings,
        &local,
    )
    .await;

    // Teardown: every exit path funnels through here. The epoch makes the
    // detach a no-op if this attachment was already superseded.
    handle.detach(participant_id.clone(), epoch).await;
    local.close();
    if outcome != ReadOutcome::SessionOver {
        // The read loop did not reap the writer; give it one bounded
        // chance to flush the closed queue, then cut it loose.
        let grace = ctx.settings.write_deadline.saturating_mul(2);
        match tokio::time::timeout(grace, &mut writer).await {
            Ok(result) => log_writer_result(result),
            Err(_) => writer.abort(),
        }
    }
    debug!(
        %peer,
        session = %session_id,
        participant = %participant_id,
        outcome = ?outcome,
        "Attachment closed"
    );
}

async fn authorize(
    token: Option<&str>,
    ctx: &AttachmentContext,
) -> Result<VerifiedCredential, ServerFrame> {
    let Some(token) = token else {
        return Err(ServerFrame::error(
            ErrorCode::Unauthorized,
            "missing attachment token",
        ));
    };
    ctx.verifier
        .verify(token)
        .await
        .map_err(|err| ServerFrame::error(ErrorCode::Unauthorized, err.to_string()))
}

/// Translate an engine-level refusal into the frame the client sees.
fn rejection_frame(err: &SessionError) -> ServerFrame {
    match err {
        SessionError::SessionNotFound(_) => {
            ServerFrame::error(ErrorCode::SessionNotFound, "session not found")
        },
        SessionError::SessionEnded => ServerFrame::SessionEnded {
            reason: EndReason::Expired,
        },
        SessionError::CapacityExceeded { max } => ServerFrame::error(
            ErrorCode::SessionFull,
            format!("session is full ({max} participants)"),
        ),
        SessionError::Overloaded => ServerFrame::error(
            ErrorCode::Overloaded,
            "session is overloaded; retry shortly",
        ),
        SessionError::CatalogUnavailable(detail) => ServerFrame::error(
            ErrorCode::Overloaded,
            format!("session catalog unavailable: {detail}"),
        ),
        other => ServerFrame::error(ErrorCode::Unauthorized, other.to_string()),
    }
}

/// Send one frame and close; used for pre-bind refusals only.
async fn reject(ws: &mut WsStream, frame: &ServerFrame) {
    let _ = ws.send(Message::Text(frame.encode())).await;
    let _ = ws.close(None).await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    writer: &mut JoinHandle<GatewayResult<()>>,
    handle: &CoordinatorHandle,
    participant_id: &ParticipantId,
    settings: &AttachmentSettings,
    local: &OutboundSender,
) -> ReadOutcome {
    let mut rate = RateLimiter::per_second(settings.inbound_rate);
    let mut errors = ProtocolErrorWindow::new(PROTOCOL_ERROR_THRESHOLD, PROTOCOL_ERROR_WINDOW);
    loop {
        tokio::select! {
            biased;
            result = &mut *writer => {
                log_writer_result(result);
                return ReadOutcome::SessionOver;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(outcome) =
                        handle_text(&text, handle, participant_id, &mut rate, &mut errors, local)
                            .await
                    {
                        return outcome;
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    let _ = local.try_push(ServerFrame::error(
                        ErrorCode::InvalidFrame,
                        "binary frames are not supported",
                    ));
                    if errors.record() {
                        return kick(handle, participant_id).await;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {},
                Some(Ok(Message::Close(_))) | None => return ReadOutcome::TransportClosed,
                Some(Err(err)) => {
                    debug!(participant = %participant_id, error = %err, "Transport read failed");
                    return ReadOutcome::TransportClosed;
                },
            }
        }
    }
}

/// Process one text frame. Returns `Some` when the read loop must exit.
async fn handle_text(
    text: &str,
    handle: &CoordinatorHandle,
    participant_id: &ParticipantId,
    rate: &mut RateLimiter,
    errors: &mut ProtocolErrorWindow,
    local: &OutboundSender,
) -> Option<ReadOutcome> {
    if !rate.allow() {
        let _ = local.try_push(ServerFrame::error(
            ErrorCode::RateLimited,
            "inbound rate limit exceeded; message dropped",
        ));
        return None;
    }
    match ClientFrame::decode(text) {
        Ok(ClientFrame::Ping) => {
            let _ = local.try_push(ServerFrame::Pong);
            if handle.touch(participant_id.clone()).is_err() {
                return Some(ReadOutcome::SessionOver);
            }
            None
        },
        Ok(ClientFrame::LocationUpdate {
            lat,
            lng,
            accuracy,
            timestamp,
            speed,
            heading,
            altitude,
        }) => {
            let record = LocationRecord::new(lat, lng, accuracy, timestamp)
                .and_then(|record| record.with_motion(speed, heading, altitude));
            match record {
                Ok(record) => {
                    if handle
                        .update_location(participant_id.clone(), record)
                        .is_err()
                    {
                        return Some(ReadOutcome::SessionOver);
                    }
                    None
                },
                Err(err) => {
                    // Invalid fix: answer locally, mutate nothing.
                    let _ = local.try_push(ServerFrame::error(
                        ErrorCode::InvalidLocation,
                        err.to_string(),
                    ));
                    if errors.record() {
                        return Some(kick(handle, participant_id).await);
                    }
                    None
                },
            }
        },
        Err(err) => {
            let _ = local.try_push(ServerFrame::error(ErrorCode::InvalidFrame, err.to_string()));
            if errors.record() {
                return Some(kick(handle, participant_id).await);
            }
            None
        },
    }
}

async fn kick(handle: &CoordinatorHandle, participant_id: &ParticipantId) -> ReadOutcome {
    warn!(
        participant = %participant_id,
        "Protocol-error threshold crossed; removing participant"
    );
    let _ = handle
        .remove(participant_id.clone(), LeaveReason::ProtocolError)
        .await;
    ReadOutcome::ProtocolKick
}

/// Drain the outbound queue onto the wire.
///
/// Exits when the queue closes (session over, detach, or supersession) or
/// when a single write misses the deadline.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: OutboundReceiver,
    deadline: Duration,
) -> GatewayResult<()> {
    while let Some(frame) = queue.recv().await {
        match tokio::time::timeout(deadline, sink.send(Message::Text(frame.encode()))).await {
            Err(_) => return Err(GatewayError::TransportDead),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(())) => {},
        }
    }
    let _ = tokio::time::timeout(deadline, sink.send(Message::Close(None))).await;
    Ok(())
}

fn log_writer_result(result: Result<GatewayResult<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) | Err(_) => {},
        Ok(Err(err)) => debug!(error = %err, "Writer exited with error"),
    }
}

// ── Inbound policing ─────────────────────────────────────────

/// Fixed-window inbound rate limiter.
#[derive(Debug)]
struct RateLimiter {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn per_second(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Account for one inbound message; `false` means drop it.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

/// Sliding window of recent protocol errors.
#[derive(Debug)]
struct ProtocolErrorWindow {
    events: VecDeque<Instant>,
    threshold: usize,
    window: Duration,
}

impl ProtocolErrorWindow {
    fn new(threshold: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            threshold,
            window,
        }
    }

    /// Record one error; `true` means the threshold was crossed.
    fn record(&mut self) -> bool {
        let now = Instant::now();
        while self
            .events
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.events.pop_front();
        }
        self.events.push_back(now);
        self.events.len() >= self.threshold
    }
}
