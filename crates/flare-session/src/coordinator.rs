//! Per-session serial worker.
//!
//! Exactly one coordinator task per live session owns the session record and
//! its participant registry. Every mutation arrives as a [`Command`] on a
//! bounded mailbox and is executed serially; timers (expiry, idle grace,
//! per-participant absence) are delivered as commands into the same mailbox,
//! so there is never a concurrent mutation.
//!
//! Fan-out happens on the worker: a broadcast is one non-blocking
//! `try_push` per attached participant. A queue that cannot even accept a
//! lifecycle frame marks its attachment unhealthy, and the coordinator
//! detaches it rather than stall the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flare_core::{
    EndReason, LeaveReason, LocationRecord, ParticipantId, ParticipantProfile, ServerFrame,
    SessionId, SessionMeta, SessionStore,
};

use crate::error::SessionError;
use crate::limits::SessionLimits;
use crate::queue::{Enqueue, OutboundSender};
use crate::registry::ParticipantRegistry;

/// Lifecycle phase of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Spawned, no participant admitted yet.
    Initial,
    /// At least one participant has been admitted.
    Active,
    /// `session_ended` is being broadcast; no new work accepted.
    Ending,
    /// Terminal.
    Ended,
}

/// Commands executed serially by the coordinator worker.
enum Command {
    Join {
        participant_id: ParticipantId,
        profile: ParticipantProfile,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Attach {
        participant_id: ParticipantId,
        profile: ParticipantProfile,
        sender: OutboundSender,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Detach {
        participant_id: ParticipantId,
        epoch: u64,
    },
    Remove {
        participant_id: ParticipantId,
        reason: LeaveReason,
        reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    },
    UpdateLocation {
        participant_id: ParticipantId,
        record: LocationRecord,
    },
    Touch {
        participant_id: ParticipantId,
    },
    End {
        reason: EndReason,
        reply: Option<oneshot::Sender<()>>,
    },
    AbsenceTimeout {
        participant_id: ParticipantId,
        epoch: u64,
    },
    IdleTimeout {
        generation: u64,
    },
    Expired,
}

/// Cloneable handle to a coordinator's mailbox.
///
/// This is the only way to reach a session: the coordinator owns its state
/// outright. Holders must treat a closed mailbox as `session_ended`; the
/// coordinator may finish while handles are still alive.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    session_id: SessionId,
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// The session this handle belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the coordinator has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the coordinator has ended.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Admit a participant without binding a transport.
    ///
    /// Re-joining while detached is idempotent; re-joining while a live
    /// attachment exists is a [`SessionError::Duplicate`].
    ///
    /// # Errors
    ///
    /// [`SessionError::Overloaded`] when the mailbox is saturated, plus the
    /// admission errors from the registry.
    pub async fn join(
        &self,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Join {
            participant_id,
            profile,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionEnded)?
    }

    /// Bind an outbound queue for a participant, admitting them on first
    /// attach and superseding any prior attachment.
    ///
    /// Returns the attachment epoch the endpoint must present on detach.
    ///
    /// # Errors
    ///
    /// [`SessionError::Overloaded`] when the mailbox is saturated;
    /// [`SessionError::SessionEnded`] once the session is over; admission
    /// errors on first attach.
    pub async fn attach(
        &self,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
        sender: OutboundSender,
    ) -> Result<u64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Attach {
            participant_id,
            profile,
            sender,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::SessionEnded)?
    }

    /// Release the attachment identified by `epoch`.
    ///
    /// The participant record survives; an absence timer decides whether
    /// they are eventually removed. Safe to call when the session is gone.
    pub async fn detach(&self, participant_id: ParticipantId, epoch: u64) {
        let _ = self
            .tx
            .send(Command::Detach {
                participant_id,
                epoch,
            })
            .await;
    }

    /// Remove a participant and broadcast `participant_left`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when already removed (removal is
    /// observably idempotent); [`SessionError::SessionEnded`] afterwards.
    pub async fn remove(
        &self,
        participant_id: ParticipantId,
        reason: LeaveReason,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Remove {
                participant_id,
                reason,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SessionError::SessionEnded)?;
        rx.await.map_err(|_| SessionError::SessionEnded)?
    }

    /// Ingest a validated location fix.
    ///
    /// Fire-and-forget on the hot path: when the mailbox is saturated the
    /// fix is dropped; the next one supersedes it.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionEnded`] once the coordinator is gone, so the
    /// endpoint can exit.
    pub fn update_location(
        &self,
        participant_id: ParticipantId,
        record: LocationRecord,
    ) -> Result<(), SessionError> {
        match self.tx.try_send(Command::UpdateLocation {
            participant_id,
            record,
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session = %self.session_id, "Mailbox saturated; dropping location update");
                Ok(())
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::SessionEnded),
        }
    }

    /// Refresh a participant's liveness (keepalive).
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionEnded`] once the coordinator is gone.
    pub fn touch(&self, participant_id: ParticipantId) -> Result<(), SessionError> {
        match self.tx.try_send(Command::Touch { participant_id }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::SessionEnded),
        }
    }

    /// End the session, waiting until `session_ended` has been fanned out
    /// and every attachment closed.
    pub async fn end(&self, reason: EndReason) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::End {
                reason,
                reply: Some(reply),
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Reject attach/join when the mailbox is saturated instead of queueing
    /// behind a backlog the session may never drain.
    fn submit(&self, command: Command) -> Result<(), SessionError> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionError::Overloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::SessionEnded),
        }
    }
}

/// The per-session state machine. Constructed only via [`Self::spawn`].
pub struct SessionCoordinator {
    session_id: SessionId,
    phase: Phase,
    registry: ParticipantRegistry,
    limits: SessionLimits,
    store: Arc<dyn SessionStore>,
    expires_at: DateTime<Utc>,
    deadline: Option<Instant>,
    idle_generation: u64,
    last_store_touch: Option<Instant>,
    timer_tx: mpsc::Sender<Command>,
    on_ended: Option<Box<dyn FnOnce(SessionId) + Send>>,
}

impl SessionCoordinator {
    /// Spawn a coordinator worker for a validated session.
    ///
    /// `on_ended` runs exactly once, after the mailbox has closed, so the
    /// directory can drop its entry.
    pub fn spawn(
        session_id: SessionId,
        meta: &SessionMeta,
        limits: SessionLimits,
        store: Arc<dyn SessionStore>,
        on_ended: impl FnOnce(SessionId) + Send + 'static,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(limits.session_backlog);

        let until_expiry = meta
            .expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now().checked_add(until_expiry);

        let coordinator = Self {
            session_id,
            phase: Phase::Initial,
            registry: ParticipantRegistry::new(limits.max_participants, limits.location_ttl),
            limits,
            store,
            expires_at: meta.expires_at,
            deadline,
            idle_generation: 0,
            last_store_touch: None,
            timer_tx: tx.clone(),
            on_ended: Some(Box::new(on_ended)),
        };
        tokio::spawn(coordinator.run(rx));

        CoordinatorHandle { session_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(
            session = %self.session_id,
            expires_at = %self.expires_at,
            "Session coordinator started"
        );
        self.spawn_expiry_timer();
        self.start_idle_timer();

        // The loop exits only through `Phase::Ended`; `self` holds a sender
        // clone for timers, so `recv` cannot observe a closed channel.
        while let Some(command) = rx.recv().await {
            self.handle(command);
            if self.phase == Phase::Ended {
                break;
            }
        }

        // Answer anything that raced into the mailbox, then close it so
        // handle holders observe the end.
        rx.close();
        while let Ok(command) = rx.try_recv() {
            Self::reject(command);
        }
        drop(rx);

        if let Some(on_ended) = self.on_ended.take() {
            on_ended(self.session_id);
        }
        info!(session = %self.session_id, "Session coordinator ended");
    }

    fn handle(&mut self, command: Command) {
        // A command arriving past the absolute deadline observes expiry
        // before anything else.
        if matches!(self.phase, Phase::Initial | Phase::Active)
            && self.deadline.is_some_and(|d| Instant::now() >= d)
        {
            self.end_session(EndReason::Expired);
        }

        match command {
            Command::Join {
                participant_id,
                profile,
                reply,
            } => {
                let result = self.handle_join(participant_id, profile);
                let _ = reply.send(result);
            },
            Command::Attach {
                participant_id,
                profile,
                sender,
                reply,
            } => {
                let result = self.handle_attach(participant_id, profile, sender);
                let _ = reply.send(result);
            },
            Command::Detach {
                participant_id,
                epoch,
            } => self.handle_detach(&participant_id, epoch),
            Command::Remove {
                participant_id,
                reason,
                reply,
            } => {
                let result = self.handle_remove(&participant_id, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            },
            Command::UpdateLocation {
                participant_id,
                record,
            } => self.handle_update_location(&participant_id, record),
            Command::Touch { participant_id } => {
                let _ = self.registry.touch(&participant_id);
            },
            Command::End { reason, reply } => {
                self.end_session(reason);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            },
            Command::AbsenceTimeout {
                participant_id,
                epoch,
            } => self.handle_absence_timeout(&participant_id, epoch),
            Command::IdleTimeout { generation } => self.handle_idle_timeout(generation),
            Command::Expired => {
                if matches!(self.phase, Phase::Initial | Phase::Active) {
                    self.end_session(EndReason::Expired);
                }
            },
        }
    }

    fn reject(command: Command) {
        match command {
            Command::Join { reply, .. } => {
                let _ = reply.send(Err(SessionError::SessionEnded));
            },
            Command::Attach { reply, sender, .. } => {
                sender.close();
                let _ = reply.send(Err(SessionError::SessionEnded));
            },
            Command::Remove { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SessionError::SessionEnded));
                }
            },
            Command::End { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            },
            Command::Detach { .. }
            | Command::UpdateLocation { .. }
            | Command::Touch { .. }
            | Command::AbsenceTimeout { .. }
            | Command::IdleTimeout { .. }
            | Command::Expired => {},
        }
    }

    fn accepting(&self) -> Result<(), SessionError> {
        match self.phase {
            Phase::Initial | Phase::Active => Ok(()),
            Phase::Ending | Phase::Ended => Err(SessionError::SessionEnded),
        }
    }

    fn handle_join(
        &mut self,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
    ) -> Result<(), SessionError> {
        self.accepting()?;
        match self.registry.get(&participant_id) {
            Some(p) if p.is_attached() => Err(SessionError::Duplicate(participant_id)),
            Some(_) => Ok(()),
            None => self.admit(participant_id, profile),
        }
    }

    fn admit(
        &mut self,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
    ) -> Result<(), SessionError> {
        self.registry.add(participant_id.clone(), profile.clone())?;
        if self.phase == Phase::Initial {
            self.phase = Phase::Active;
        }
        self.cancel_idle_timer();
        info!(
            session = %self.session_id,
            participant = %participant_id,
            count = self.registry.len(),
            "Participant joined"
        );
        self.broadcast(
            &ServerFrame::ParticipantJoined {
                participant_id: participant_id.clone(),
                display_name: profile.display_name,
                avatar_color: profile.avatar_color,
            },
            Some(&participant_id),
        );
        self.touch_store();
        Ok(())
    }

    fn handle_attach(
        &mut self,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
        sender: OutboundSender,
    ) -> Result<u64, SessionError> {
        if let Err(err) = self.accepting() {
            sender.close();
            return Err(err);
        }
        if !self.registry.contains(&participant_id)
            && let Err(err) = self.admit(participant_id.clone(), profile)
        {
            sender.close();
            return Err(err);
        }

        // NotFound is unreachable: the participant was just ensured.
        let (epoch, prior) = self.registry.attach(&participant_id, sender)?;
        if let Some(prior) = prior {
            let _ = prior.try_push(ServerFrame::SessionEnded {
                reason: EndReason::Superseded,
            });
            prior.close();
            debug!(
                session = %self.session_id,
                participant = %participant_id,
                "Prior attachment superseded"
            );
        }

        // Snapshots are taken after the attach so every later broadcast
        // strictly follows them on this queue.
        self.registry.collect_stale_locations();
        let participants = self.registry.snapshot_participants(Some(&participant_id));
        let locations = self.registry.snapshot_locations(Some(&participant_id));
        if let Some(queue) = self.registry.sender(&participant_id) {
            let _ = queue.try_push(ServerFrame::InitialParticipants { participants });
            let _ = queue.try_push(ServerFrame::InitialLocations { locations });
        }

        self.cancel_idle_timer();
        debug!(
            session = %self.session_id,
            participant = %participant_id,
            epoch,
            "Attachment bound"
        );
        Ok(epoch)
    }

    fn handle_detach(&mut self, participant_id: &ParticipantId, epoch: u64) {
        if self.phase != Phase::Active {
            return;
        }
        if self.registry.detach(participant_id, epoch) {
            debug!(
                session = %self.session_id,
                participant = %participant_id,
                epoch,
                "Attachment released"
            );
            self.start_absence_timer(participant_id.clone(), epoch);
        }
    }

    fn handle_remove(
        &mut self,
        participant_id: &ParticipantId,
        reason: LeaveReason,
    ) -> Result<(), SessionError> {
        self.accepting()?;
        self.registry.remove(participant_id)?;
        info!(
            session = %self.session_id,
            participant = %participant_id,
            %reason,
            count = self.registry.len(),
            "Participant left"
        );
        self.broadcast(
            &ServerFrame::ParticipantLeft {
                participant_id: participant_id.clone(),
                reason,
            },
            None,
        );
        if self.registry.is_empty() {
            self.start_idle_timer();
        }
        Ok(())
    }

    fn handle_update_location(&mut self, participant_id: &ParticipantId, record: LocationRecord) {
        if self.phase != Phase::Active {
            return;
        }
        match self.registry.update_location(participant_id, record) {
            Ok(()) => {
                self.broadcast(
                    &ServerFrame::location_update(participant_id.clone(), &record),
                    Some(participant_id),
                );
                self.touch_store();
            },
            Err(SessionError::StaleLocation) => {
                debug!(
                    session = %self.session_id,
                    participant = %participant_id,
                    "Dropped stale location update"
                );
            },
            Err(_) => {
                debug!(
                    session = %self.session_id,
                    participant = %participant_id,
                    "Dropped location update for unknown participant"
                );
            },
        }
    }

    fn handle_absence_timeout(&mut self, participant_id: &ParticipantId, epoch: u64) {
        if self.phase != Phase::Active {
            return;
        }
        let absent = self
            .registry
            .get(participant_id)
            .is_some_and(|p| !p.is_attached() && p.epoch() == epoch);
        if absent {
            let _ = self.handle_remove(participant_id, LeaveReason::Timeout);
        }
    }

    fn handle_idle_timeout(&mut self, generation: u64) {
        if generation == self.idle_generation
            && self.registry.is_empty()
            && matches!(self.phase, Phase::Initial | Phase::Active)
        {
            self.end_session(EndReason::Idle);
        }
    }

    /// ACTIVE → ENDING → ENDED. `session_ended` is the last frame every
    /// queue receives; afterwards every attachment is closed.
    fn end_session(&mut self, reason: EndReason) {
        if matches!(self.phase, Phase::Ending | Phase::Ended) {
            return;
        }
        self.phase = Phase::Ending;
        info!(
            session = %self.session_id,
            %reason,
            participants = self.registry.len(),
            "Session ending"
        );
        self.fan_out(&ServerFrame::SessionEnded { reason }, None);
        self.registry.detach_all();
        self.phase = Phase::Ended;
    }

    /// Fan out a frame and deal with attachments that could not take it.
    fn broadcast(&mut self, frame: &ServerFrame, except: Option<&ParticipantId>) {
        let unhealthy = self.fan_out(frame, except);
        for participant_id in unhealthy {
            if let Some(epoch) = self.registry.force_detach(&participant_id) {
                warn!(
                    session = %self.session_id,
                    participant = %participant_id,
                    "Outbound queue not draining; detached unhealthy attachment"
                );
                self.start_absence_timer(participant_id, epoch);
            }
        }
    }

    /// One non-blocking enqueue per attached participant. Never stalls:
    /// saturated queues are reported back, not waited on.
    fn fan_out(&self, frame: &ServerFrame, except: Option<&ParticipantId>) -> Vec<ParticipantId> {
        let mut unhealthy = Vec::new();
        for (participant_id, sender) in self.registry.attached(except) {
            match sender.try_push(frame.clone()) {
                Enqueue::Delivered => {},
                Enqueue::Evicted => {
                    debug!(
                        session = %self.session_id,
                        participant = %participant_id,
                        "Evicted oldest queued update for a slow consumer"
                    );
                },
                Enqueue::Unhealthy => unhealthy.push(participant_id.clone()),
                Enqueue::Closed => {},
            }
        }
        unhealthy
    }

    // ── Timers ───────────────────────────────────────────────
    //
    // Timer tasks hold only a sender clone and re-enter the mailbox;
    // `try_send` is deliberate: a mailbox too busy to take a timer tick is
    // a session that is not idle.

    fn spawn_expiry_timer(&self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Command::Expired).await;
        });
    }

    fn start_idle_timer(&mut self) {
        self.idle_generation = self.idle_generation.wrapping_add(1);
        let generation = self.idle_generation;
        let grace = self.limits.idle_grace;
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.try_send(Command::IdleTimeout { generation });
        });
    }

    fn cancel_idle_timer(&mut self) {
        self.idle_generation = self.idle_generation.wrapping_add(1);
    }

    fn start_absence_timer(&self, participant_id: ParticipantId, epoch: u64) {
        let timeout = self.limits.absence_timeout;
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.try_send(Command::AbsenceTimeout {
                participant_id,
                epoch,
            });
        });
    }

    /// Best-effort, throttled last-activity write to the catalog.
    fn touch_store(&mut self) {
        let now = Instant::now();
        let due = self
            .last_store_touch
            .is_none_or(|last| now.duration_since(last) >= self.limits.location_ttl);
        if !due {
            return;
        }
        self.last_store_touch = Some(now);
        let store = Arc::clone(&self.store);
        let session_id = self.session_id;
        tokio::spawn(async move {
            if let Err(err) = store.touch_activity(session_id).await {
                warn!(session = %session_id, error = %err, "Failed to record session activity");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OutboundReceiver, outbound_queue};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use flare_core::StoreError;
    use std::time::Duration;

    // ── Helpers ──────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct NullStore;

    #[async_trait]
    impl SessionStore for NullStore {
        async fn validate(&self, session_id: SessionId) -> Result<SessionMeta, StoreError> {
            Err(StoreError::NotFound(session_id))
        }

        async fn touch_activity(&self, _session_id: SessionId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn meta_expiring_in(seconds: i64) -> SessionMeta {
        SessionMeta {
            expires_at: Utc::now()
                .checked_add_signed(TimeDelta::seconds(seconds))
                .unwrap(),
            is_active: true,
            name: None,
        }
    }

    fn small_limits() -> SessionLimits {
        SessionLimits {
            outbound_queue: 4,
            ..SessionLimits::default()
        }
    }

    fn spawn_with(limits: SessionLimits, expires_in_secs: i64) -> CoordinatorHandle {
        SessionCoordinator::spawn(
            SessionId::new(),
            &meta_expiring_in(expires_in_secs),
            limits,
            Arc::new(NullStore),
            |_| {},
        )
    }

    fn profile(name: &str) -> ParticipantProfile {
        ParticipantProfile::new(name, "#20a080").unwrap()
    }

    async fn attach(handle: &CoordinatorHandle, id: &str) -> (u64, OutboundReceiver) {
        let (tx, rx) = outbound_queue(4);
        let epoch = handle
            .attach(id.into(), profile(id), tx)
            .await
            .expect("attach failed");
        (epoch, rx)
    }

    async fn next_frame(rx: &mut OutboundReceiver) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed while a frame was expected")
    }

    /// Drain the two initial snapshot frames an attachment always receives.
    async fn drain_initials(rx: &mut OutboundReceiver) {
        assert!(matches!(
            next_frame(rx).await,
            ServerFrame::InitialParticipants { .. }
        ));
        assert!(matches!(
            next_frame(rx).await,
            ServerFrame::InitialLocations { .. }
        ));
    }

    fn fix_at(offset_secs: i64) -> LocationRecord {
        let base: DateTime<Utc> = "2025-01-15T10:30:00Z".parse().unwrap();
        let ts = base.checked_add_signed(TimeDelta::seconds(offset_secs)).unwrap();
        LocationRecord::new(37.7749, -122.4194, 5.0, ts).unwrap()
    }

    /// Wait until every previously submitted command has been executed.
    ///
    /// A duplicate `join` for an attached participant is rejected without
    /// side effects, and its reply proves the mailbox drained up to here.
    async fn barrier(handle: &CoordinatorHandle, attached_id: &str) {
        let result = handle.join(attached_id.into(), profile(attached_id)).await;
        assert!(matches!(result, Err(SessionError::Duplicate(_))));
    }

    // ── Lifecycle ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn solo_attach_sees_empty_snapshots_then_expiry() {
        let handle = spawn_with(small_limits(), 2);
        let (_epoch, mut rx) = attach(&handle, "a").await;

        match next_frame(&mut rx).await {
            ServerFrame::InitialParticipants { participants } => assert!(participants.is_empty()),
            other => panic!("expected initial_participants, got {other:?}"),
        }
        match next_frame(&mut rx).await {
            ServerFrame::InitialLocations { locations } => assert!(locations.is_empty()),
            other => panic!("expected initial_locations, got {other:?}"),
        }

        // The expiry timer fires and `session_ended` is the final frame.
        assert_eq!(
            next_frame(&mut rx).await,
            ServerFrame::SessionEnded {
                reason: EndReason::Expired
            }
        );
        assert_eq!(rx.recv().await, None);

        handle.closed().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_others_but_never_echoes() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, mut rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;

        drain_initials(&mut rx_a).await;
        // A learns about B joining before any update from B.
        assert!(matches!(
            next_frame(&mut rx_a).await,
            ServerFrame::ParticipantJoined { participant_id, .. } if participant_id == "b".into()
        ));
        drain_initials(&mut rx_b).await;

        handle.update_location("a".into(), fix_at(0)).unwrap();
        match next_frame(&mut rx_b).await {
            ServerFrame::LocationUpdate {
                participant_id,
                lat,
                lng,
                accuracy,
                timestamp,
            } => {
                assert_eq!(participant_id, "a".into());
                assert!((lat - 37.7749).abs() < f64::EPSILON);
                assert!((lng + 122.4194).abs() < f64::EPSILON);
                assert!((accuracy - 5.0).abs() < f64::EPSILON);
                assert_eq!(timestamp, fix_at(0).client_timestamp());
            },
            other => panic!("expected location_update, got {other:?}"),
        }

        // No self-echo: A's queue stays empty.
        barrier(&handle, "a").await;
        assert_eq!(rx_a.try_recv(), None);
    }

    #[tokio::test]
    async fn joined_precedes_first_update_from_that_participant() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, mut rx_a) = attach(&handle, "a").await;
        drain_initials(&mut rx_a).await;

        let (_eb, _rx_b) = attach(&handle, "b").await;
        handle.update_location("b".into(), fix_at(0)).unwrap();

        assert!(matches!(
            next_frame(&mut rx_a).await,
            ServerFrame::ParticipantJoined { participant_id, .. } if participant_id == "b".into()
        ));
        assert!(matches!(
            next_frame(&mut rx_a).await,
            ServerFrame::LocationUpdate { participant_id, .. } if participant_id == "b".into()
        ));
    }

    #[tokio::test]
    async fn stale_and_replayed_updates_are_dropped_silently() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, _rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        drain_initials(&mut rx_b).await;

        handle.update_location("a".into(), fix_at(10)).unwrap();
        // Strictly older, then an exact replay: both dropped.
        handle.update_location("a".into(), fix_at(5)).unwrap();
        handle.update_location("a".into(), fix_at(10)).unwrap();
        handle.update_location("a".into(), fix_at(20)).unwrap();
        barrier(&handle, "a").await;

        let first = next_frame(&mut rx_b).await;
        assert!(matches!(
            first,
            ServerFrame::LocationUpdate { ref timestamp, .. } if *timestamp == fix_at(10).client_timestamp()
        ));
        let second = next_frame(&mut rx_b).await;
        assert!(matches!(
            second,
            ServerFrame::LocationUpdate { ref timestamp, .. } if *timestamp == fix_at(20).client_timestamp()
        ));
        assert_eq!(rx_b.try_recv(), None);
    }

    #[tokio::test]
    async fn slow_consumer_is_bounded_and_never_blocks_the_sender() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, _rx_a) = attach(&handle, "a").await;
        // B attaches and then never reads.
        let (_eb, mut rx_b) = attach(&handle, "b").await;

        for n in 0..50 {
            handle.update_location("a".into(), fix_at(n)).unwrap();
        }
        barrier(&handle, "a").await;

        // B's queue held at most its bound; the newest update survived.
        let mut drained = Vec::new();
        while let Some(frame) = rx_b.try_recv() {
            drained.push(frame);
        }
        assert!(drained.len() <= 4, "queue exceeded its bound: {}", drained.len());
        assert!(matches!(
            drained.last(),
            Some(ServerFrame::LocationUpdate { timestamp, .. })
                if *timestamp == fix_at(49).client_timestamp()
        ));
    }

    #[tokio::test]
    async fn priority_frame_lands_on_a_full_queue() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, _rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;

        // Fill B's queue with droppable frames (2 initials + 2 updates).
        handle.update_location("a".into(), fix_at(0)).unwrap();
        handle.update_location("a".into(), fix_at(1)).unwrap();
        barrier(&handle, "a").await;

        // A lifecycle frame must still land, evicting the oldest update.
        let (_ec, _rx_c) = attach(&handle, "c").await;
        barrier(&handle, "a").await;

        let mut drained = Vec::new();
        while let Some(frame) = rx_b.try_recv() {
            drained.push(frame);
        }
        assert!(drained.len() <= 4);
        assert!(matches!(
            drained.last(),
            Some(ServerFrame::ParticipantJoined { participant_id, .. })
                if *participant_id == ParticipantId::from("c")
        ));
    }

    #[tokio::test]
    async fn reconnect_supersedes_quietly() {
        let handle = spawn_with(small_limits(), 3600);
        let (epoch1, mut rx_a1) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        drain_initials(&mut rx_a1).await;
        assert!(matches!(
            next_frame(&mut rx_a1).await,
            ServerFrame::ParticipantJoined { .. }
        ));
        drain_initials(&mut rx_b).await;

        // Second attachment for A supersedes the first.
        let (epoch2, mut rx_a2) = attach(&handle, "a").await;
        assert!(epoch2 > epoch1);

        // Old attachment: best-effort notice, then closed.
        assert_eq!(
            next_frame(&mut rx_a1).await,
            ServerFrame::SessionEnded {
                reason: EndReason::Superseded
            }
        );
        assert_eq!(rx_a1.recv().await, None);

        // New attachment: fresh snapshots naming B.
        match next_frame(&mut rx_a2).await {
            ServerFrame::InitialParticipants { participants } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].participant_id, "b".into());
            },
            other => panic!("expected initial_participants, got {other:?}"),
        }

        // Other participants observe neither a leave nor a duplicate join.
        barrier(&handle, "b").await;
        assert_eq!(rx_b.try_recv(), None);

        // The superseded endpoint's detach must not hurt the live one.
        handle.detach("a".into(), epoch1).await;
        handle.update_location("b".into(), fix_at(0)).unwrap();
        assert!(matches!(
            next_frame(&mut rx_a2).await,
            ServerFrame::InitialLocations { .. }
        ));
        assert!(matches!(
            next_frame(&mut rx_a2).await,
            ServerFrame::LocationUpdate { participant_id, .. }
                if participant_id == "b".into()
        ));
    }

    #[tokio::test]
    async fn end_session_is_the_final_frame_for_everyone() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, mut rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        let (_ec, mut rx_c) = attach(&handle, "c").await;

        handle.end(EndReason::EndedByCreator).await;
        handle.closed().await;

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            let mut last = None;
            while let Some(frame) = rx.recv().await {
                last = Some(frame);
            }
            assert_eq!(
                last,
                Some(ServerFrame::SessionEnded {
                    reason: EndReason::EndedByCreator
                })
            );
        }

        // Terminal: every further command is refused.
        assert!(matches!(
            handle.join("d".into(), profile("d")).await,
            Err(SessionError::SessionEnded)
        ));
        let (tx, _rx) = outbound_queue(4);
        assert!(matches!(
            handle.attach("d".into(), profile("d"), tx).await,
            Err(SessionError::SessionEnded)
        ));
        assert!(matches!(
            handle.update_location("a".into(), fix_at(99)),
            Err(SessionError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn capacity_is_enforced_at_the_cap() {
        let limits = SessionLimits {
            max_participants: 2,
            ..small_limits()
        };
        let handle = spawn_with(limits, 3600);
        let (_ea, _rx_a) = attach(&handle, "a").await;
        let (_eb, _rx_b) = attach(&handle, "b").await;

        let (tx, _rx) = outbound_queue(4);
        assert!(matches!(
            handle.attach("c".into(), profile("c"), tx).await,
            Err(SessionError::CapacityExceeded { max: 2 })
        ));
        assert!(matches!(
            handle.join("c".into(), profile("c")).await,
            Err(SessionError::CapacityExceeded { max: 2 })
        ));
    }

    #[tokio::test]
    async fn remove_broadcasts_left_and_is_observably_idempotent() {
        let handle = spawn_with(small_limits(), 3600);
        let (_ea, mut rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        drain_initials(&mut rx_a).await;
        assert!(matches!(
            next_frame(&mut rx_a).await,
            ServerFrame::ParticipantJoined { .. }
        ));
        drain_initials(&mut rx_b).await;

        handle.remove("b".into(), LeaveReason::Left).await.unwrap();
        assert_eq!(
            next_frame(&mut rx_a).await,
            ServerFrame::ParticipantLeft {
                participant_id: "b".into(),
                reason: LeaveReason::Left,
            }
        );
        // B's queue was closed before the broadcast; nothing more arrives.
        assert_eq!(rx_b.recv().await, None);

        // A removed participant never receives further frames.
        handle.update_location("a".into(), fix_at(0)).unwrap();
        barrier(&handle, "a").await;

        assert!(matches!(
            handle.remove("b".into(), LeaveReason::Left).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejoin_is_idempotent_only_while_detached() {
        let handle = spawn_with(small_limits(), 3600);
        let (epoch, _rx) = attach(&handle, "a").await;

        assert!(matches!(
            handle.join("a".into(), profile("a")).await,
            Err(SessionError::Duplicate(_))
        ));

        handle.detach("a".into(), epoch).await;
        handle.join("a".into(), profile("a")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn absent_participant_is_removed_after_the_timeout() {
        let handle = spawn_with(small_limits(), 3600);
        let (epoch_a, rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        drain_initials(&mut rx_b).await;
        drop(rx_a);

        handle.detach("a".into(), epoch_a).await;

        // The absence timer fires and the removal is broadcast.
        assert_eq!(
            next_frame(&mut rx_b).await,
            ServerFrame::ParticipantLeft {
                participant_id: "a".into(),
                reason: LeaveReason::Timeout,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_cancels_the_absence_timer() {
        let handle = spawn_with(small_limits(), 3600);
        let (epoch_a, rx_a) = attach(&handle, "a").await;
        let (_eb, mut rx_b) = attach(&handle, "b").await;
        drain_initials(&mut rx_b).await;
        drop(rx_a);

        handle.detach("a".into(), epoch_a).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        let (_epoch_a2, _rx_a2) = attach(&handle, "a").await;

        // Let the stale absence timer fire; it must be a no-op.
        tokio::time::advance(Duration::from_secs(40)).await;
        barrier(&handle, "a").await;
        assert_eq!(rx_b.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_session_ends_after_idle_grace() {
        let handle = spawn_with(small_limits(), 3600);
        let (epoch, rx) = attach(&handle, "a").await;
        drop(rx);
        handle.detach("a".into(), epoch).await;

        // Absence removal empties the session; idle grace then ends it.
        tokio::time::timeout(Duration::from_secs(180), handle.closed())
            .await
            .expect("session did not end while idle");
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn never_joined_session_ends_after_idle_grace() {
        let handle = spawn_with(small_limits(), 3600);
        tokio::time::timeout(Duration::from_secs(120), handle.closed())
            .await
            .expect("session did not end while idle");
    }

    #[tokio::test]
    async fn wall_of_priority_frames_detaches_the_attachment() {
        let limits = SessionLimits {
            outbound_queue: 2,
            ..SessionLimits::default()
        };
        let handle = spawn_with(limits, 3600);
        // B's queue (capacity 2) fills with its two initials, which later
        // lifecycle frames evict one by one until only priority remains.
        let (tx_b, mut rx_b) = outbound_queue(2);
        handle
            .attach("b".into(), profile("b"), tx_b)
            .await
            .unwrap();
        let (_ec, _rx_c) = attach(&handle, "c").await;
        let (_ed, _rx_d) = attach(&handle, "d").await;
        // Queue now holds joined{c}, joined{d}: the next lifecycle frame
        // cannot land and B must be force-detached.
        let (_ee, _rx_e) = attach(&handle, "e").await;
        barrier(&handle, "e").await;

        let mut drained = Vec::new();
        while let Some(frame) = rx_b.recv().await {
            drained.push(frame);
        }
        assert!(drained.iter().all(ServerFrame::is_priority));
        assert!(!handle.is_closed());
    }
}
