//! Shared fixtures for the integration tests: a signing origin server,
//! event builders and in-memory fakes of the processor's trait seams.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use ring::{
    digest,
    signature::{Ed25519KeyPair, KeyPair},
};
use ruma::{
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, OwnedRoomId, OwnedServerName,
    OwnedUserId, RoomId, RoomVersionId, ServerName, UserId,
};
use serde_json::value::RawValue;

use matrixon_inbound::{
    error::TransientError,
    traits::{
        DirectoryStore, EduProducer, FederationTransport, KeyRing, OffsetStore, OutputLog,
        RoomServerApi,
    },
    types::{
        HeaderedPdu, LatestEvents, LogMessage, MissingEventsParams, Pdu, RawState, RespState,
        RespStateIds, SendPolicy, StateAfterEvents,
    },
};

/// Domain of the remote origin server used throughout the tests
pub const ORIGIN: &str = "remote.test";

/// Key ID the origin signs with
pub const KEY_ID: &str = "ed25519:auto";

/// Room all fixture events live in
pub const ROOM: &str = "!room:remote.test";

/// A remote homeserver with a signing identity
pub struct TestOrigin {
    keypair: Ed25519KeyPair,
    pub server: OwnedServerName,
}

/// A signed event in both raw and parsed form
pub struct SignedEvent {
    pub raw: Box<RawValue>,
    pub pdu: Pdu,
}

impl TestOrigin {
    pub fn new() -> Self {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("keypair generation");
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("keypair decoding");
        Self {
            keypair,
            server: OwnedServerName::try_from(ORIGIN).unwrap(),
        }
    }

    /// A key ring that trusts this origin's signing key
    pub fn keyring(&self) -> Arc<StaticKeyRing> {
        let mut keys = HashMap::new();
        keys.insert(
            (ORIGIN.to_owned(), KEY_ID.to_owned()),
            self.keypair.public_key().as_ref().to_vec(),
        );
        Arc::new(StaticKeyRing { keys })
    }

    /// Signs an event body the way an honest origin would: content hash
    /// first, then the signature over everything but the signatures.
    pub fn sign(&self, body: serde_json::Value) -> SignedEvent {
        let mut object: CanonicalJsonObject =
            serde_json::from_value(body).expect("canonical event body");

        let hashable = canonical_without(&object, &["signatures", "unsigned", "hashes"]);
        let content_hash = STANDARD_NO_PAD.encode(digest::digest(&digest::SHA256, &hashable));
        let mut hashes = CanonicalJsonObject::new();
        hashes.insert(
            "sha256".to_owned(),
            CanonicalJsonValue::String(content_hash),
        );
        object.insert("hashes".to_owned(), CanonicalJsonValue::Object(hashes));

        let message = canonical_without(&object, &["signatures"]);
        let signature = STANDARD_NO_PAD.encode(self.keypair.sign(&message));
        let mut key_signatures = CanonicalJsonObject::new();
        key_signatures.insert(KEY_ID.to_owned(), CanonicalJsonValue::String(signature));
        let mut signatures = CanonicalJsonObject::new();
        signatures.insert(
            ORIGIN.to_owned(),
            CanonicalJsonValue::Object(key_signatures),
        );
        object.insert(
            "signatures".to_owned(),
            CanonicalJsonValue::Object(signatures),
        );

        let reference = canonical_without(&object, &["signatures", "unsigned"]);
        let event_id = format!(
            "${}",
            URL_SAFE_NO_PAD.encode(digest::digest(&digest::SHA256, &reference))
        );
        let event_id = EventId::parse(event_id).expect("reference hash forms a valid event id");

        let raw = RawValue::from_string(serde_json::to_string(&object).unwrap()).unwrap();

        let mut with_id = object;
        with_id.insert(
            "event_id".to_owned(),
            CanonicalJsonValue::String(event_id.to_string()),
        );
        let pdu: Pdu = serde_json::from_str(&serde_json::to_string(&with_id).unwrap())
            .expect("signed event parses as a PDU");

        SignedEvent { raw, pdu }
    }
}

fn canonical_without(object: &CanonicalJsonObject, drop: &[&str]) -> Vec<u8> {
    let mut scratch = object.clone();
    for key in drop {
        scratch.remove(*key);
    }
    serde_json::to_vec(&scratch).unwrap()
}

/// Builds an unsigned event body
pub fn event_body(
    kind: &str,
    sender: &str,
    state_key: Option<&str>,
    prev: &[OwnedEventId],
    auth: &[OwnedEventId],
    depth: i64,
    content: serde_json::Value,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "room_id": ROOM,
        "type": kind,
        "sender": sender,
        "origin_server_ts": 1_700_000_000_000u64 + depth as u64,
        "prev_events": prev.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        "auth_events": auth.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        "depth": depth,
        "content": content,
    });
    if let Some(state_key) = state_key {
        body["state_key"] = serde_json::Value::String(state_key.to_owned());
    }
    body
}

/// The standing state of the fixture room: create, creator membership and
/// power levels, all signed by the origin
pub struct RoomFixture {
    pub create: SignedEvent,
    pub member: SignedEvent,
    pub power: SignedEvent,
}

impl RoomFixture {
    pub fn new(origin: &TestOrigin) -> Self {
        let creator = format!("@alice:{ORIGIN}");

        let create = origin.sign(event_body(
            "m.room.create",
            &creator,
            Some(""),
            &[],
            &[],
            1,
            serde_json::json!({"room_version": "10"}),
        ));

        let member = origin.sign(event_body(
            "m.room.member",
            &creator,
            Some(&creator),
            &[create.pdu.event_id.clone()],
            &[create.pdu.event_id.clone()],
            2,
            serde_json::json!({"membership": "join"}),
        ));

        let power = origin.sign(event_body(
            "m.room.power_levels",
            &creator,
            Some(""),
            &[member.pdu.event_id.clone()],
            &[create.pdu.event_id.clone(), member.pdu.event_id.clone()],
            3,
            serde_json::json!({
                "users": {"@alice:remote.test": 100},
                "users_default": 0,
                "events_default": 0,
                "state_default": 50,
                "ban": 50,
                "kick": 50,
                "invite": 0
            }),
        ));

        Self {
            create,
            member,
            power,
        }
    }

    pub fn state(&self) -> Vec<Pdu> {
        vec![
            self.create.pdu.clone(),
            self.member.pdu.clone(),
            self.power.pdu.clone(),
        ]
    }

    pub fn state_ids(&self) -> Vec<OwnedEventId> {
        self.state().iter().map(|pdu| pdu.event_id.clone()).collect()
    }

    pub fn auth_ids(&self) -> Vec<OwnedEventId> {
        self.state_ids()
    }
}

/// In-memory room state engine
#[derive(Default)]
pub struct FakeRoomServer {
    pub versions: Mutex<HashMap<OwnedRoomId, RoomVersionId>>,
    pub events: Mutex<HashMap<OwnedEventId, Pdu>>,
    pub state: Mutex<HashMap<OwnedRoomId, Vec<Pdu>>>,
    pub latest: Mutex<HashMap<OwnedRoomId, LatestEvents>>,
    pub committed: Mutex<Vec<(OwnedEventId, bool)>>,
    pub fail_commits: AtomicBool,
}

impl FakeRoomServer {
    /// Wires up the fixture room with its standing state
    pub fn with_room(fixture: &RoomFixture) -> Arc<Self> {
        let server = Self::default();
        let room: OwnedRoomId = ROOM.try_into().unwrap();
        server
            .versions
            .lock()
            .unwrap()
            .insert(room.clone(), RoomVersionId::V10);
        {
            let mut events = server.events.lock().unwrap();
            for pdu in fixture.state() {
                events.insert(pdu.event_id.clone(), pdu);
            }
        }
        server
            .state
            .lock()
            .unwrap()
            .insert(room.clone(), fixture.state());
        server.latest.lock().unwrap().insert(
            room,
            LatestEvents {
                event_ids: vec![fixture.power.pdu.event_id.clone()],
                depth: 3,
            },
        );
        Arc::new(server)
    }

    pub fn committed_ids(&self) -> Vec<OwnedEventId> {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl RoomServerApi for FakeRoomServer {
    async fn query_room_version(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomVersionId>, TransientError> {
        Ok(self.versions.lock().unwrap().get(room_id).cloned())
    }

    async fn query_state_after_events(
        &self,
        room_id: &RoomId,
        prev_event_ids: &[OwnedEventId],
    ) -> Result<StateAfterEvents, TransientError> {
        let version = self.versions.lock().unwrap().get(room_id).cloned();
        let Some(version) = version else {
            return Ok(StateAfterEvents {
                room_exists: false,
                prev_events_exist: false,
                room_version: None,
                state_events: Vec::new(),
            });
        };

        let events = self.events.lock().unwrap();
        let prev_events_exist = prev_event_ids.iter().all(|id| events.contains_key(id));
        drop(events);

        let state_events = self
            .state
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|pdu| pdu.headered(version.clone()))
            .collect();

        Ok(StateAfterEvents {
            room_exists: true,
            prev_events_exist,
            room_version: Some(version),
            state_events,
        })
    }

    async fn query_events_by_id(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<Vec<HeaderedPdu>, TransientError> {
        let events = self.events.lock().unwrap();
        Ok(event_ids
            .iter()
            .filter_map(|id| events.get(id).cloned())
            .map(|pdu| pdu.headered(RoomVersionId::V10))
            .collect())
    }

    async fn query_latest_events_and_state(
        &self,
        room_id: &RoomId,
    ) -> Result<LatestEvents, TransientError> {
        Ok(self
            .latest
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or(LatestEvents {
                event_ids: Vec::new(),
                depth: 0,
            }))
    }

    async fn send_events(
        &self,
        events: Vec<HeaderedPdu>,
        _policy: SendPolicy,
    ) -> Result<(), TransientError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(TransientError::room_server("database unavailable"));
        }
        for headered in events {
            self.committed
                .lock()
                .unwrap()
                .push((headered.event.event_id.clone(), false));
            self.events
                .lock()
                .unwrap()
                .insert(headered.event.event_id.clone(), headered.event);
        }
        Ok(())
    }

    async fn send_event_with_state(
        &self,
        _state: RespState,
        event: HeaderedPdu,
    ) -> Result<(), TransientError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(TransientError::room_server("database unavailable"));
        }
        self.committed
            .lock()
            .unwrap()
            .push((event.event.event_id.clone(), true));
        self.events
            .lock()
            .unwrap()
            .insert(event.event.event_id.clone(), event.event);
        Ok(())
    }
}

/// Scripted federation transport: every endpoint answers from a canned
/// response and records the call order
#[derive(Default)]
pub struct ScriptedFederation {
    pub events: Mutex<HashMap<OwnedEventId, Box<RawValue>>>,
    pub state_ids_response: Mutex<Option<Result<RespStateIds, String>>>,
    pub state_response: Mutex<Option<RawState>>,
    pub missing_response: Mutex<Option<Vec<Box<RawValue>>>>,
    pub calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl FederationTransport for ScriptedFederation {
    async fn get_event(
        &self,
        _destination: &ServerName,
        event_id: &EventId,
    ) -> Result<Vec<Box<RawValue>>, TransientError> {
        self.calls.lock().unwrap().push("get_event");
        self.events
            .lock()
            .unwrap()
            .get(event_id)
            .map(|raw| vec![raw.clone()])
            .ok_or_else(|| TransientError::federation(format!("no such event {event_id}")))
    }

    async fn state_ids(
        &self,
        _destination: &ServerName,
        _room_id: &RoomId,
        _event_id: &EventId,
    ) -> Result<RespStateIds, TransientError> {
        self.calls.lock().unwrap().push("state_ids");
        match self.state_ids_response.lock().unwrap().clone() {
            Some(Ok(response)) => Ok(response),
            Some(Err(reason)) => Err(TransientError::federation(reason)),
            None => Err(TransientError::federation("state_ids not scripted")),
        }
    }

    async fn state(
        &self,
        _destination: &ServerName,
        _room_id: &RoomId,
        _event_id: &EventId,
    ) -> Result<RawState, TransientError> {
        self.calls.lock().unwrap().push("state");
        self.state_response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransientError::federation("state not scripted"))
    }

    async fn missing_events(
        &self,
        _destination: &ServerName,
        _room_id: &RoomId,
        _params: MissingEventsParams,
    ) -> Result<Vec<Box<RawValue>>, TransientError> {
        self.calls.lock().unwrap().push("missing_events");
        self.missing_response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransientError::federation("get_missing_events failed"))
    }
}

/// Key ring backed by a static key map
pub struct StaticKeyRing {
    pub keys: HashMap<(String, String), Vec<u8>>,
}

#[async_trait]
impl KeyRing for StaticKeyRing {
    async fn verification_key(
        &self,
        server: &ServerName,
        key_id: &str,
    ) -> Result<Option<Vec<u8>>, TransientError> {
        Ok(self
            .keys
            .get(&(server.to_string(), key_id.to_owned()))
            .cloned())
    }
}

/// EDU producer that records forwarded typing notifications
#[derive(Default)]
pub struct RecordingEduProducer {
    pub typing: Mutex<Vec<(OwnedUserId, OwnedRoomId, bool, Duration)>>,
}

#[async_trait]
impl EduProducer for RecordingEduProducer {
    async fn send_typing(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), TransientError> {
        self.typing.lock().unwrap().push((
            user_id.to_owned(),
            room_id.to_owned(),
            typing,
            timeout,
        ));
        Ok(())
    }
}

/// Output log over a fixed message vector
pub struct VecLog {
    pub messages: Vec<LogMessage>,
}

#[async_trait]
impl OutputLog for VecLog {
    async fn next_message(
        &self,
        _topic: &str,
        _partition: i32,
        after_offset: i64,
    ) -> Result<LogMessage, TransientError> {
        self.messages
            .iter()
            .find(|message| message.offset > after_offset)
            .cloned()
            .ok_or_else(|| TransientError::federation("partition drained"))
    }
}

/// Offset store over a mutex-guarded map
#[derive(Default)]
pub struct MemOffsets {
    pub stored: Mutex<HashMap<(String, i32), i64>>,
}

#[async_trait]
impl OffsetStore for MemOffsets {
    async fn load_offset(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, TransientError> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .get(&(topic.to_owned(), partition))
            .copied())
    }

    async fn save_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), TransientError> {
        self.stored
            .lock()
            .unwrap()
            .insert((topic.to_owned(), partition), offset);
        Ok(())
    }
}

/// Directory store that records applied deltas
#[derive(Default)]
pub struct RecordingDirectory {
    pub updates: Mutex<Vec<(Vec<OwnedEventId>, Vec<OwnedEventId>)>>,
}

#[async_trait]
impl DirectoryStore for RecordingDirectory {
    async fn update_room(&self, adds: &[Pdu], removes: &[Pdu]) -> Result<(), TransientError> {
        self.updates.lock().unwrap().push((
            adds.iter().map(|pdu| pdu.event_id.clone()).collect(),
            removes.iter().map(|pdu| pdu.event_id.clone()).collect(),
        ));
        Ok(())
    }
}
