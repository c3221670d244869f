//! Engine-wide bounds.

use std::time::Duration;

/// Default participant cap per session.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 50;

/// Default per-attachment outbound queue capacity, in frames.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default coordinator mailbox capacity, in commands.
pub const DEFAULT_SESSION_BACKLOG: usize = 4096;

/// Default TTL after which a stored location is stale.
pub const DEFAULT_LOCATION_TTL: Duration = Duration::from_secs(30);

/// Default grace period before an empty session ends itself.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);

/// Default wait for a detached participant to re-attach before removal.
pub const DEFAULT_ABSENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounds enforced by every coordinator.
///
/// Loaded once at process startup from the gateway configuration; tests
/// shrink individual fields to exercise the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum participants per session.
    pub max_participants: usize,
    /// Per-attachment outbound queue capacity, in frames.
    pub outbound_queue: usize,
    /// Coordinator command mailbox capacity.
    pub session_backlog: usize,
    /// TTL after which a stored location is stale.
    pub location_ttl: Duration,
    /// How long an empty session lingers before ending itself.
    pub idle_grace: Duration,
    /// How long a detached participant may stay absent before removal.
    pub absence_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            session_backlog: DEFAULT_SESSION_BACKLOG,
            location_ttl: DEFAULT_LOCATION_TTL,
            idle_grace: DEFAULT_IDLE_GRACE,
            absence_timeout: DEFAULT_ABSENCE_TIMEOUT,
        }
    }
}
