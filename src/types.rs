// =============================================================================
// Matrixon Inbound Federation - Types Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the core types exchanged between the transaction
// processor, the room server interface, the federation transport and the
// public rooms consumer: parsed events, transaction envelopes, state
// responses and room server output messages.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{
    OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomVersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Rejection;

/// A parsed and verified room event (PDU).
///
/// Instances are only produced by the signature and parse gate in
/// `validation`; everything downstream may assume the signatures verified
/// under the room version the event was parsed with. Events are immutable
/// once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pdu {
    /// Reference-hash event ID, computed during parsing
    pub event_id: OwnedEventId,

    /// Room this event belongs to
    pub room_id: OwnedRoomId,

    /// Event type, e.g. `m.room.message`
    #[serde(rename = "type")]
    pub kind: String,

    /// Fully-qualified user ID of the sender
    pub sender: OwnedUserId,

    /// Origin timestamp in milliseconds since the Unix epoch
    #[serde(default)]
    pub origin_server_ts: u64,

    /// State key for state events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Parents of this event in the room graph; empty only for m.room.create
    #[serde(default)]
    pub prev_events: Vec<OwnedEventId>,

    /// State events this event cites to justify its authorization
    #[serde(default)]
    pub auth_events: Vec<OwnedEventId>,

    /// Depth claimed by the sender
    #[serde(default)]
    pub depth: i64,

    /// Opaque event content
    pub content: Box<RawValue>,
}

impl Pdu {
    /// Pairs the event with its room version tag.
    ///
    /// The room version governs parse, hash and redaction rules and must
    /// travel with the event through every boundary where parsing could
    /// differ.
    pub fn headered(self, room_version: RoomVersionId) -> HeaderedPdu {
        HeaderedPdu {
            room_version,
            event: self,
        }
    }

    /// The `(type, state_key)` tuple for state events, `None` otherwise
    pub fn state_tuple(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.kind.clone(), key.clone()))
    }
}

/// An event paired with the room version it was parsed under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderedPdu {
    /// Room version tag owned by the room server for this room
    pub room_version: RoomVersionId,

    /// The event itself
    pub event: Pdu,
}

/// Wire body of `PUT /_matrix/federation/v1/send/{txnId}`
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    /// Raw events, preserved in sender order
    #[serde(default)]
    pub pdus: Vec<Box<RawValue>>,

    /// Ephemeral events
    #[serde(default)]
    pub edus: Vec<Edu>,
}

/// A decoded federation transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Server that pushed the transaction
    pub origin: OwnedServerName,

    /// Opaque transaction ID chosen by the origin
    pub transaction_id: String,

    /// This server's name
    pub destination: OwnedServerName,

    /// Raw events, preserved in sender order
    pub pdus: Vec<Box<RawValue>>,

    /// Ephemeral events
    pub edus: Vec<Edu>,
}

/// An ephemeral data unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edu {
    /// EDU type, e.g. `m.typing`
    pub edu_type: String,

    /// Opaque EDU payload
    pub content: Box<RawValue>,
}

/// Per-event outcome in a transaction response.
///
/// Serializes as `{}` for accepted events and `{"error": ...}` for rejected
/// ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PduResult {
    /// Rejection reason, absent for accepted events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of the federation send endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RespSend {
    /// One entry per processed event
    pub pdus: BTreeMap<OwnedEventId, PduResult>,
}

/// Response of `GET /_matrix/federation/v1/state_ids/{roomId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespStateIds {
    /// IDs of the state events at the requested event
    pub pdu_ids: Vec<OwnedEventId>,

    /// IDs of the auth chain of those state events
    pub auth_chain_ids: Vec<OwnedEventId>,
}

/// Raw response of `GET /_matrix/federation/v1/state/{roomId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawState {
    /// Unverified state events
    #[serde(default)]
    pub pdus: Vec<Box<RawValue>>,

    /// Unverified auth chain events
    #[serde(default)]
    pub auth_chain: Vec<Box<RawValue>>,
}

/// A verified state snapshot at some event
#[derive(Debug, Clone)]
pub struct RespState {
    /// State events, every one parsed and signature-checked
    pub state_events: Vec<Pdu>,

    /// Auth chain events, every one parsed and signature-checked
    pub auth_events: Vec<Pdu>,
}

impl RespState {
    /// Re-checks the internal consistency of an assembled state snapshot.
    ///
    /// Every auth event cited by a member of the snapshot must itself be
    /// present in the snapshot, otherwise a later authorization pass could
    /// be asked to trust an unverifiable chain.
    pub fn check(&self) -> Result<(), Rejection> {
        let known: std::collections::HashSet<&OwnedEventId> = self
            .state_events
            .iter()
            .chain(self.auth_events.iter())
            .map(|event| &event.event_id)
            .collect();

        for event in self.state_events.iter().chain(self.auth_events.iter()) {
            for auth_id in &event.auth_events {
                if !known.contains(auth_id) {
                    return Err(Rejection::MissingAuthEvent(auth_id.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Parameters of `POST /_matrix/federation/v1/get_missing_events/{roomId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingEventsParams {
    /// Maximum number of events to return
    pub limit: u32,

    /// Do not return events below this depth
    pub min_depth: i64,

    /// Leaves this server already knows; traversal stops at them
    pub earliest_events: Vec<OwnedEventId>,

    /// Events whose ancestry should be returned
    pub latest_events: Vec<OwnedEventId>,
}

/// Room server answer to a state-after-events query
#[derive(Debug, Clone)]
pub struct StateAfterEvents {
    /// Whether the room is known to this server at all
    pub room_exists: bool,

    /// Whether every queried prev event is already in the room graph
    pub prev_events_exist: bool,

    /// Room version, present whenever the room exists
    pub room_version: Option<RoomVersionId>,

    /// The state at the queried events, when available
    pub state_events: Vec<HeaderedPdu>,
}

/// Room server answer to a forward-extremities query
#[derive(Debug, Clone)]
pub struct LatestEvents {
    /// Current leaves of the room graph
    pub event_ids: Vec<OwnedEventId>,

    /// Maximum depth seen in the room
    pub depth: i64,
}

/// Controls whether the room server relays a committed event back out over
/// federation. Inbound events must never be re-federated, otherwise two
/// servers pushing to each other would echo forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Commit only; the event came in over federation
    DoNotSendToOtherServers,

    /// Commit and relay to every server in the room
    SendToOtherServers,
}

/// Message types on the room server output log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// A new event was appended to a room
    NewRoomEvent,

    /// A local user was invited
    NewInviteEvent,

    /// A pending invite was retired
    RetireInviteEvent,
}

/// Envelope of a room server output log message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Discriminator for the payload below
    #[serde(rename = "type")]
    pub kind: OutputType,

    /// Payload for `new_room_event` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_room_event: Option<NewRoomEvent>,
}

/// A committed room event together with its state delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoomEvent {
    /// The committed event with its room version header
    pub event: HeaderedPdu,

    /// State events added by this commit
    #[serde(default)]
    pub adds_state_event_ids: Vec<OwnedEventId>,

    /// State events removed by this commit
    #[serde(default)]
    pub removes_state_event_ids: Vec<OwnedEventId>,
}

/// One message from the partitioned room server output log
#[derive(Debug, Clone)]
pub struct LogMessage {
    /// Topic the message was published on
    pub topic: String,

    /// Partition within the topic
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Raw message payload
    pub payload: Vec<u8>,
}
