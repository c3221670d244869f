//! Flare Session - the session coordination and broadcast engine.
//!
//! One coordinator task per live session owns all session state and
//! serializes every mutation through a bounded command mailbox. Fan-out is
//! non-blocking: each attachment has a bounded outbound queue with a
//! priority class for lifecycle frames, so one slow client can never stall
//! a session.
//!
//! The pieces, leaves first:
//! - [`queue`]: bounded per-attachment outbound queues
//! - [`registry`]: per-session participant map and derived queries
//! - [`coordinator`]: the per-session serial worker
//! - [`directory`]: process-wide map from session id to coordinator

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod coordinator;
pub mod directory;
pub mod error;
pub mod limits;
pub mod queue;
pub mod registry;

pub use coordinator::{CoordinatorHandle, SessionCoordinator};
pub use directory::SessionDirectory;
pub use error::SessionError;
pub use limits::SessionLimits;
pub use queue::{Enqueue, OutboundReceiver, OutboundSender, outbound_queue};
pub use registry::{AttachmentState, Participant, ParticipantRegistry};
