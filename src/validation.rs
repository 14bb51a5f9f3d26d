// =============================================================================
// Matrixon Inbound Federation - Validation Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// The signature and parse gate. Every event received over federation passes
// through here exactly once per parse: canonical JSON decoding, content hash
// verification, Ed25519 signature verification against the key ring, and
// reference-hash event ID computation. Only this module constructs `Pdu`
// values from untrusted input.
//
// =============================================================================

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use ring::{
    digest,
    signature::{UnparsedPublicKey, ED25519},
};
use ruma::{
    CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedEventId, OwnedUserId, RoomId,
    RoomVersionId, UserId,
};
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::{
    error::{FederationError, Rejection},
    traits::KeyRing,
    types::Pdu,
};

/// Key algorithm prefix accepted for event signatures
const ED25519_PREFIX: &str = "ed25519:";

/// Parses an untrusted event under the given room version and verifies its
/// content hash and signatures.
///
/// The room version is owned by the room server for the event's room; it is
/// the caller's job to have resolved it before parsing. Any event-intrinsic
/// problem surfaces as a [`Rejection`]; a key ring outage surfaces as a
/// transient failure.
pub async fn parse_and_verify(
    raw: &RawValue,
    room_version: &RoomVersionId,
    keyring: &dyn KeyRing,
) -> Result<Pdu, FederationError> {
    let mut object: CanonicalJsonObject = serde_json::from_str(raw.get())
        .map_err(|err| Rejection::InvalidEvent(format!("not canonical JSON: {err}")))?;

    // The unsigned section is sender-local metadata and is excluded from
    // both hashing and signing.
    object.remove("unsigned");

    verify_content_hash(&object)?;

    let event_id = resolve_event_id(&object)?;

    let sender = sender_of(&object, &event_id)?;
    verify_signatures(&object, &event_id, sender.server_name(), keyring).await?;

    debug!(event_id = %event_id, version = %room_version, "event passed the signature gate");

    into_pdu(object, event_id)
}

/// Rejects events fetched for one room that claim to belong to another
pub(crate) fn check_room_id(room_id: &RoomId, pdu: &Pdu) -> Result<(), Rejection> {
    if pdu.room_id != room_id {
        warn!(
            event_id = %pdu.event_id,
            claimed = %pdu.room_id,
            expected = %room_id,
            "event carries wrong room id"
        );
        return Err(Rejection::InvalidEvent(format!(
            "event {} belongs to room {}, not {}",
            pdu.event_id, pdu.room_id, room_id
        )));
    }
    Ok(())
}

/// Computes the SHA-256 content hash over the event minus its signatures,
/// unsigned section and hashes, and compares it to the declared hash.
fn verify_content_hash(object: &CanonicalJsonObject) -> Result<(), Rejection> {
    let declared = match object.get("hashes") {
        Some(CanonicalJsonValue::Object(hashes)) => match hashes.get("sha256") {
            Some(CanonicalJsonValue::String(hash)) => hash.clone(),
            _ => {
                return Err(Rejection::InvalidEvent(
                    "event carries no sha256 content hash".to_owned(),
                ))
            }
        },
        _ => {
            return Err(Rejection::InvalidEvent(
                "event carries no hashes section".to_owned(),
            ))
        }
    };

    let mut scratch = object.clone();
    scratch.remove("signatures");
    scratch.remove("unsigned");
    scratch.remove("hashes");
    let bytes = canonical_bytes(&scratch)?;
    let computed = STANDARD_NO_PAD.encode(digest::digest(&digest::SHA256, &bytes));

    if computed != declared {
        return Err(Rejection::InvalidEvent(
            "content hash does not match event body".to_owned(),
        ));
    }

    Ok(())
}

/// Resolves the event ID: an explicit `event_id` field when the sender
/// provided one, the reference hash of the event otherwise.
fn resolve_event_id(object: &CanonicalJsonObject) -> Result<OwnedEventId, Rejection> {
    if let Some(CanonicalJsonValue::String(explicit)) = object.get("event_id") {
        return EventId::parse(explicit.as_str())
            .map_err(|err| Rejection::InvalidEvent(format!("invalid event_id field: {err}")));
    }

    let mut scratch = object.clone();
    scratch.remove("signatures");
    scratch.remove("unsigned");
    let bytes = canonical_bytes(&scratch)?;
    let hash = URL_SAFE_NO_PAD.encode(digest::digest(&digest::SHA256, &bytes));

    EventId::parse(format!("${hash}"))
        .map_err(|err| Rejection::InvalidEvent(format!("computed event id is invalid: {err}")))
}

/// Verifies the sender server's Ed25519 signatures over the event.
///
/// Every listed ed25519 key for the sender's server is checked against the
/// key ring; a single forged signature rejects the event, and at least one
/// signature must verify against a known key.
async fn verify_signatures(
    object: &CanonicalJsonObject,
    event_id: &EventId,
    server: &ruma::ServerName,
    keyring: &dyn KeyRing,
) -> Result<(), FederationError> {
    let bad_signature = |reason: &str| Rejection::BadSignature {
        event_id: event_id.to_string(),
        reason: reason.to_owned(),
    };

    let signatures = match object.get("signatures") {
        Some(CanonicalJsonValue::Object(signatures)) => signatures,
        _ => return Err(bad_signature("event carries no signatures section").into()),
    };

    let server_signatures = match signatures.get(server.as_str()) {
        Some(CanonicalJsonValue::Object(entries)) => entries,
        _ => return Err(bad_signature("event is not signed by the sender's server").into()),
    };

    let mut scratch = object.clone();
    scratch.remove("signatures");
    let message =
        canonical_bytes(&scratch).map_err(|err| Rejection::InvalidEvent(err.to_string()))?;

    let mut verified = 0usize;
    for (key_id, signature) in server_signatures {
        if !key_id.starts_with(ED25519_PREFIX) {
            continue;
        }

        let signature = match signature {
            CanonicalJsonValue::String(signature) => signature,
            _ => return Err(bad_signature("signature is not a string").into()),
        };

        let Some(key) = keyring.verification_key(server, key_id).await? else {
            warn!(server = %server, key_id = %key_id, "no verification key available");
            continue;
        };

        let signature_bytes = STANDARD_NO_PAD
            .decode(signature)
            .map_err(|_| bad_signature("signature is not valid base64"))?;

        UnparsedPublicKey::new(&ED25519, key)
            .verify(&message, &signature_bytes)
            .map_err(|_| bad_signature("ed25519 signature verification failed"))?;

        verified += 1;
    }

    if verified == 0 {
        return Err(bad_signature("no signature could be checked against a known key").into());
    }

    Ok(())
}

fn sender_of(
    object: &CanonicalJsonObject,
    event_id: &EventId,
) -> Result<OwnedUserId, Rejection> {
    match object.get("sender") {
        Some(CanonicalJsonValue::String(sender)) => {
            UserId::parse(sender.as_str()).map_err(|err| {
                Rejection::InvalidEvent(format!("event {event_id} has invalid sender: {err}"))
            })
        }
        _ => Err(Rejection::InvalidEvent(format!(
            "event {event_id} has no sender"
        ))),
    }
}

/// Serializes a canonical object to its signing and hashing byte form.
///
/// Canonical JSON orders keys lexicographically; `CanonicalJsonObject` is a
/// BTreeMap, so plain serialization already yields the canonical encoding.
fn canonical_bytes(object: &CanonicalJsonObject) -> Result<Vec<u8>, Rejection> {
    serde_json::to_vec(object)
        .map_err(|err| Rejection::InvalidEvent(format!("canonical serialization failed: {err}")))
}

/// Converts a verified canonical object into a typed event
fn into_pdu(
    mut object: CanonicalJsonObject,
    event_id: OwnedEventId,
) -> Result<Pdu, FederationError> {
    object.insert(
        "event_id".to_owned(),
        CanonicalJsonValue::String(event_id.to_string()),
    );

    let serialized = serde_json::to_string(&object)
        .map_err(|err| Rejection::InvalidEvent(format!("canonical serialization failed: {err}")))?;
    let pdu: Pdu = serde_json::from_str(&serialized)
        .map_err(|err| Rejection::InvalidEvent(format!("event is not a valid PDU: {err}")))?;

    Ok(pdu)
}
