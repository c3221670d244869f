//! Per-session participant registry.
//!
//! Owned exclusively by the session coordinator; never locked, never shared.
//! Encapsulates the participant map and every derived query the coordinator
//! needs: capacity checks, attachment supersession, location monotonicity,
//! and the snapshot/fan-out iterations.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use flare_core::{
    LocationRecord, LocationSnapshot, ParticipantId, ParticipantProfile, ParticipantSnapshot,
};

use crate::error::SessionError;
use crate::queue::OutboundSender;

/// Attachment state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// No live transport; the absence timer may be running.
    Detached,
    /// Exactly one live transport owns the outbound queue.
    Attached,
}

/// One participant's state within a session.
#[derive(Debug)]
pub struct Participant {
    id: ParticipantId,
    profile: ParticipantProfile,
    joined_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    /// Bumped on every attach; identifies which attachment a detach or
    /// absence timeout refers to, so a superseded endpoint cannot tear down
    /// its successor.
    epoch: u64,
    sender: Option<OutboundSender>,
    current_location: Option<LocationRecord>,
}

impl Participant {
    fn new(id: ParticipantId, profile: ParticipantProfile) -> Self {
        let now = Utc::now();
        Self {
            id,
            profile,
            joined_at: now,
            last_activity_at: now,
            epoch: 0,
            sender: None,
            current_location: None,
        }
    }

    /// Participant identifier.
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Display profile.
    #[must_use]
    pub fn profile(&self) -> &ParticipantProfile {
        &self.profile
    }

    /// When the participant was admitted.
    #[must_use]
    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Wall-clock time of the last inbound message.
    #[must_use]
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Current attachment state.
    #[must_use]
    pub fn attachment_state(&self) -> AttachmentState {
        if self.sender.is_some() {
            AttachmentState::Attached
        } else {
            AttachmentState::Detached
        }
    }

    /// Whether a live transport is bound.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.sender.is_some()
    }

    /// Epoch of the most recent attachment.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The most recent accepted location, if any.
    #[must_use]
    pub fn current_location(&self) -> Option<&LocationRecord> {
        self.current_location.as_ref()
    }

    fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            participant_id: self.id.clone(),
            display_name: self.profile.display_name.clone(),
            avatar_color: self.profile.avatar_color.clone(),
            last_seen: self.last_activity_at,
            is_active: self.is_attached(),
        }
    }
}

/// The `(participant-id → Participant)` mapping for one session.
#[derive(Debug)]
pub struct ParticipantRegistry {
    participants: HashMap<ParticipantId, Participant>,
    max_participants: usize,
    location_ttl: Duration,
    next_epoch: u64,
}

impl ParticipantRegistry {
    /// Create an empty registry with the given cap and location TTL.
    #[must_use]
    pub fn new(max_participants: usize, location_ttl: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            max_participants,
            location_ttl,
            next_epoch: 1,
        }
    }

    /// Number of participants, attached or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether the session currently has no participants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Whether a participant exists.
    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    /// Look up a participant.
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Admit a new participant.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidProfile`] if the profile fails validation,
    /// [`SessionError::Duplicate`] if the id already exists, and
    /// [`SessionError::CapacityExceeded`] at the participant cap.
    pub fn add(
        &mut self,
        id: ParticipantId,
        profile: ParticipantProfile,
    ) -> Result<(), SessionError> {
        profile.validate()?;
        if self.participants.contains_key(&id) {
            return Err(SessionError::Duplicate(id));
        }
        if self.participants.len() >= self.max_participants {
            return Err(SessionError::CapacityExceeded {
                max: self.max_participants,
            });
        }
        self.participants.insert(id.clone(), Participant::new(id, profile));
        Ok(())
    }

    /// Remove a participant, closing any live attachment first.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if no such participant exists (which makes
    /// a second removal observably idempotent to the caller).
    pub fn remove(&mut self, id: &ParticipantId) -> Result<Participant, SessionError> {
        let participant = self
            .participants
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if let Some(sender) = &participant.sender {
            sender.close();
        }
        Ok(participant)
    }

    /// Bind a new outbound queue, superseding any prior attachment.
    ///
    /// Returns the new attachment epoch and the superseded sender, if one
    /// existed, so the coordinator can notify and close it.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if no such participant exists.
    pub fn attach(
        &mut self,
        id: &ParticipantId,
        sender: OutboundSender,
    ) -> Result<(u64, Option<OutboundSender>), SessionError> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        let epoch = self.next_epoch;
        self.next_epoch = self.next_epoch.wrapping_add(1);
        participant.epoch = epoch;
        participant.last_activity_at = Utc::now();
        let prior = participant.sender.replace(sender);
        Ok((epoch, prior))
    }

    /// Detach the attachment identified by `epoch`.
    ///
    /// A stale epoch (the attachment was already superseded) is a no-op, so
    /// a dying endpoint can never tear down its successor. Returns whether a
    /// detach actually happened.
    pub fn detach(&mut self, id: &ParticipantId, epoch: u64) -> bool {
        let Some(participant) = self.participants.get_mut(id) else {
            return false;
        };
        if participant.epoch != epoch || participant.sender.is_none() {
            return false;
        }
        if let Some(sender) = participant.sender.take() {
            sender.close();
        }
        true
    }

    /// Detach whatever attachment a participant currently has.
    ///
    /// Used when the coordinator itself declares the attachment unhealthy.
    /// Returns the detached attachment's epoch.
    pub fn force_detach(&mut self, id: &ParticipantId) -> Option<u64> {
        let participant = self.participants.get_mut(id)?;
        let sender = participant.sender.take()?;
        sender.close();
        Some(participant.epoch)
    }

    /// Close every attachment. Used during session teardown.
    pub fn detach_all(&mut self) {
        for participant in self.participants.values_mut() {
            if let Some(sender) = participant.sender.take() {
                sender.close();
            }
        }
    }

    /// Store a new location for a participant.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for an unknown participant.
    /// [`SessionError::StaleLocation`] if the new record's client timestamp
    /// is not strictly newer than the stored one; equal timestamps are
    /// replays and are rejected the same way.
    pub fn update_location(
        &mut self,
        id: &ParticipantId,
        record: LocationRecord,
    ) -> Result<(), SessionError> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if let Some(current) = &participant.current_location
            && record.client_timestamp() <= current.client_timestamp()
        {
            return Err(SessionError::StaleLocation);
        }
        participant.current_location = Some(record);
        participant.last_activity_at = Utc::now();
        Ok(())
    }

    /// Refresh a participant's liveness without any other state change.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for an unknown participant.
    pub fn touch(&mut self, id: &ParticipantId) -> Result<(), SessionError> {
        let participant = self
            .participants
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        participant.last_activity_at = Utc::now();
        Ok(())
    }

    /// The outbound sender currently bound to a participant, if attached.
    #[must_use]
    pub fn sender(&self, id: &ParticipantId) -> Option<&OutboundSender> {
        self.participants.get(id).and_then(|p| p.sender.as_ref())
    }

    /// Snapshot every participant except `except`.
    #[must_use]
    pub fn snapshot_participants(
        &self,
        except: Option<&ParticipantId>,
    ) -> Vec<ParticipantSnapshot> {
        self.participants
            .values()
            .filter(|p| except != Some(&p.id))
            .map(Participant::snapshot)
            .collect()
    }

    /// Snapshot every fresh location except `except`'s own.
    ///
    /// Stale records (older than the location TTL) are skipped; they will be
    /// superseded or garbage-collected.
    #[must_use]
    pub fn snapshot_locations(&self, except: Option<&ParticipantId>) -> Vec<LocationSnapshot> {
        self.participants
            .values()
            .filter(|p| except != Some(&p.id))
            .filter_map(|p| {
                p.current_location
                    .as_ref()
                    .filter(|record| !record.is_stale(self.location_ttl))
                    .map(|record| LocationSnapshot::from_record(p.id.clone(), record))
            })
            .collect()
    }

    /// Iterate the attached participants except `except`, yielding each
    /// exactly once with its outbound sender.
    pub fn attached(
        &self,
        except: Option<&ParticipantId>,
    ) -> impl Iterator<Item = (&ParticipantId, &OutboundSender)> {
        let except = except.cloned();
        self.participants
            .values()
            .filter(move |p| except.as_ref() != Some(&p.id))
            .filter_map(|p| p.sender.as_ref().map(|sender| (&p.id, sender)))
    }

    /// Drop stale location records.
    ///
    /// Freshness is re-checked at snapshot time anyway; this just returns
    /// the memory.
    pub fn collect_stale_locations(&mut self) {
        let ttl = self.location_ttl;
        for participant in self.participants.values_mut() {
            if participant
                .current_location
                .as_ref()
                .is_some_and(|record| record.is_stale(ttl))
            {
                participant.current_location = None;
            }
        }
    }
}
