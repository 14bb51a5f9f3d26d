// =============================================================================
// Matrixon Inbound Federation - Error Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the error taxonomy for inbound federation processing.
// Failures fall into three disjoint classes with different dispositions:
// envelope-level failures reject the whole transaction, event-intrinsic
// failures are recorded against the offending event only, and server-local
// transient failures abort processing so the sender retries later.
//
// =============================================================================

use ruma::{OwnedEventId, OwnedRoomId};
use thiserror::Error;

/// Result type for inbound federation operations
pub type Result<T, E = FederationError> = std::result::Result<T, E>;

/// Top-level error type, tagged by disposition class
#[derive(Error, Debug)]
pub enum FederationError {
    /// The transaction envelope could not be decoded into processable
    /// events. Surfaces as HTTP 400 with no per-event result map.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// An event failed on its own merits. Recorded in the per-event result
    /// map; the rest of the transaction keeps processing.
    #[error(transparent)]
    Rejection(#[from] Rejection),

    /// A failure local to this server or its dependencies. Aborts the
    /// transaction with HTTP 500; the sender will retry the whole batch.
    #[error(transparent)]
    Transient(#[from] TransientError),

    /// Configuration validation error
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl FederationError {
    /// True when the failure should be recorded against the single event and
    /// processing should continue with the next event in the transaction.
    ///
    /// Only room-not-found and authorization rejections qualify. Anything
    /// else observed mid-transaction means the server could not come to a
    /// verdict on the event and must not silently drop it.
    pub fn skips_event_only(&self) -> bool {
        matches!(
            self,
            FederationError::Rejection(Rejection::RoomNotFound(_))
                | FederationError::Rejection(Rejection::NotAllowed { .. })
        )
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Event-intrinsic rejection reasons
#[derive(Error, Debug)]
pub enum Rejection {
    /// The event's room is not known to this server
    #[error("room {0} not found")]
    RoomNotFound(OwnedRoomId),

    /// The event JSON does not parse under the room version's rules
    #[error("unable to parse event: {0}")]
    InvalidEvent(String),

    /// One of the event's required signatures did not verify
    #[error("unable to verify signature of event {event_id}: {reason}")]
    BadSignature { event_id: String, reason: String },

    /// The room state at the event does not authorize it
    #[error("event {event_id} not allowed by state: {reason}")]
    NotAllowed {
        event_id: OwnedEventId,
        reason: String,
    },

    /// An auth event cited by the event is absent from the supplied state set
    #[error("auth event {0} missing from the supplied state")]
    MissingAuthEvent(OwnedEventId),
}

impl Rejection {
    /// Creates a new authorization rejection
    pub fn not_allowed(event_id: OwnedEventId, reason: impl Into<String>) -> Self {
        Self::NotAllowed {
            event_id,
            reason: reason.into(),
        }
    }
}

/// Server-local transient failures
#[derive(Error, Debug)]
pub enum TransientError {
    /// A room server RPC failed
    #[error("room server query failed: {0}")]
    RoomServer(String),

    /// The signing key provider was unavailable
    #[error("key ring lookup failed: {0}")]
    KeyRing(String),

    /// An outbound federation request failed
    #[error("federation request failed: {0}")]
    Federation(String),

    /// The per-transaction federation call budget ran out
    #[error("federation call budget of {0} exhausted")]
    BudgetExhausted(u32),

    /// Missing-event resolution recursed past the configured bound
    #[error("recursion limit of {0} reached while resolving missing events")]
    RecursionLimit(u32),

    /// An operation exceeded its deadline
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

impl TransientError {
    /// Creates a new room server error
    pub fn room_server(msg: impl Into<String>) -> Self {
        Self::RoomServer(msg.into())
    }

    /// Creates a new key ring error
    pub fn key_ring(msg: impl Into<String>) -> Self {
        Self::KeyRing(msg.into())
    }

    /// Creates a new federation transport error
    pub fn federation(msg: impl Into<String>) -> Self {
        Self::Federation(msg.into())
    }
}
