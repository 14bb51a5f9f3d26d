// =============================================================================
// Matrixon Inbound Federation - Traits Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the trait seams between the transaction processor and
// its collaborators: the room state engine, the outbound federation
// transport, the signing key provider, the EDU producer, and the partitioned
// output log consumed by the public rooms projector. All of them are consumed
// as `Arc<dyn Trait>` so the processor can be wired against production
// implementations or in-memory fakes alike.
//
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, RoomId, RoomVersionId, ServerName, UserId};
use serde_json::value::RawValue;

use crate::{
    error::TransientError,
    types::{
        HeaderedPdu, LatestEvents, LogMessage, MissingEventsParams, Pdu, RawState, RespState,
        RespStateIds, SendPolicy, StateAfterEvents,
    },
};

/// Interface to the room state engine
#[async_trait]
pub trait RoomServerApi: Send + Sync {
    /// Looks up the room version tag for a room.
    ///
    /// Returns `Ok(None)` when the room is unknown to this server; an `Err`
    /// means the engine itself failed and the caller should abort.
    async fn query_room_version(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomVersionId>, TransientError>;

    /// Queries the room state immediately after the given prev events
    async fn query_state_after_events(
        &self,
        room_id: &RoomId,
        prev_event_ids: &[OwnedEventId],
    ) -> Result<StateAfterEvents, TransientError>;

    /// Bulk-fetches locally known events by ID; unknown IDs are omitted
    async fn query_events_by_id(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<HeaderedPdu>, TransientError>;

    /// Queries the current forward extremities and maximum depth of a room
    async fn query_latest_events_and_state(
        &self,
        room_id: &RoomId,
    ) -> Result<LatestEvents, TransientError>;

    /// Durably enqueues verified events for commit
    async fn send_events(
        &self,
        events: Vec<HeaderedPdu>,
        policy: SendPolicy,
    ) -> Result<(), TransientError>;

    /// Durably enqueues a verified event together with the state at it
    async fn send_event_with_state(
        &self,
        state: RespState,
        event: HeaderedPdu,
    ) -> Result<(), TransientError>;
}

/// Outbound federation calls used to reconcile gaps in room history
#[async_trait]
pub trait FederationTransport: Send + Sync {
    /// `GET /_matrix/federation/v1/event/{eventId}` — fetch a single event
    async fn get_event(
        &self,
        destination: &ServerName,
        event_id: &EventId,
    ) -> Result<Vec<Box<RawValue>>, TransientError>;

    /// `GET /_matrix/federation/v1/state_ids/{roomId}` — state and auth
    /// chain IDs at an event
    async fn state_ids(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RespStateIds, TransientError>;

    /// `GET /_matrix/federation/v1/state/{roomId}` — full state at an event
    async fn state(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RawState, TransientError>;

    /// `POST /_matrix/federation/v1/get_missing_events/{roomId}` — events
    /// between our extremities and the given latest events
    async fn missing_events(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        params: MissingEventsParams,
    ) -> Result<Vec<Box<RawValue>>, TransientError>;
}

/// Verified signing key provider.
///
/// Implementations may fetch keys remotely; key rotation and caching are
/// their concern, not the processor's.
#[async_trait]
pub trait KeyRing: Send + Sync {
    /// Resolves the Ed25519 verification key `key_id` published by `server`.
    ///
    /// Returns `Ok(None)` when no such key can be obtained; an `Err` means
    /// the provider itself was unavailable.
    async fn verification_key(
        &self,
        server: &ServerName,
        key_id: &str,
    ) -> Result<Option<Vec<u8>>, TransientError>;
}

/// Sink for ephemeral events forwarded out of inbound transactions
#[async_trait]
pub trait EduProducer: Send + Sync {
    /// Forwards a typing notification
    async fn send_typing(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), TransientError>;
}

/// Partitioned, offset-addressed room server output log
#[async_trait]
pub trait OutputLog: Send + Sync {
    /// Returns the next message strictly after `after_offset` on the given
    /// topic partition, waiting until one is available. `-1` starts from the
    /// beginning of the partition.
    async fn next_message(
        &self,
        topic: &str,
        partition: i32,
        after_offset: i64,
    ) -> Result<LogMessage, TransientError>;
}

/// Persisted consumer positions, one per topic partition
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Loads the last processed offset, if any
    async fn load_offset(&self, topic: &str, partition: i32)
        -> Result<Option<i64>, TransientError>;

    /// Persists the last processed offset
    async fn save_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), TransientError>;
}

/// Public rooms directory storage
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Applies one state delta to the directory as a single update
    async fn update_room(&self, adds: &[Pdu], removes: &[Pdu]) -> Result<(), TransientError>;
}
