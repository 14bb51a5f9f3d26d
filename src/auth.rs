// =============================================================================
// Matrixon Inbound Federation - Auth Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Authorization of events against a state set. An auth index maps
// (type, state_key) tuples to state events; the authorization predicate
// evaluates an event against that index following the room version
// authorization rules: create checks, sender membership, membership
// transitions and power levels.
//
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use ruma::{OwnedEventId, UserId};
use serde::Deserialize;
use tracing::trace;

use crate::{error::Rejection, types::Pdu};

const ROOM_CREATE: &str = "m.room.create";
const ROOM_MEMBER: &str = "m.room.member";
const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
const ROOM_JOIN_RULES: &str = "m.room.join_rules";

const MEMBERSHIP_JOIN: &str = "join";
const MEMBERSHIP_INVITE: &str = "invite";
const MEMBERSHIP_LEAVE: &str = "leave";
const MEMBERSHIP_BAN: &str = "ban";

/// Index of a state set by `(type, state_key)` tuple
pub struct AuthIndex<'a> {
    entries: BTreeMap<(String, String), &'a Pdu>,
}

impl<'a> AuthIndex<'a> {
    /// Builds an index from a state set.
    ///
    /// A state set carrying two events for the same tuple is internally
    /// inconsistent and cannot be used for authorization.
    pub fn from_state(state: &'a [Pdu]) -> Result<Self, Rejection> {
        let mut entries = BTreeMap::new();
        for event in state {
            let Some(tuple) = event.state_tuple() else {
                return Err(Rejection::InvalidEvent(format!(
                    "non-state event {} in state set",
                    event.event_id
                )));
            };
            if entries.insert(tuple, event).is_some() {
                return Err(Rejection::InvalidEvent(format!(
                    "state set contains ({}, {}) more than once",
                    event.kind,
                    event.state_key.as_deref().unwrap_or_default()
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Looks up the state event for a tuple
    pub fn get(&self, kind: &str, state_key: &str) -> Option<&'a Pdu> {
        self.entries
            .get(&(kind.to_owned(), state_key.to_owned()))
            .copied()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MemberContent {
    membership: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateContent {
    #[serde(default)]
    creator: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JoinRulesContent {
    join_rule: String,
}

fn default_fifty() -> i64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
struct PowerLevelsContent {
    #[serde(default)]
    users: BTreeMap<String, i64>,
    #[serde(default)]
    users_default: i64,
    #[serde(default)]
    events: BTreeMap<String, i64>,
    #[serde(default)]
    events_default: i64,
    #[serde(default = "default_fifty")]
    state_default: i64,
    #[serde(default = "default_fifty")]
    ban: i64,
    #[serde(default = "default_fifty")]
    kick: i64,
    #[serde(default)]
    invite: i64,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            invite: 0,
        }
    }
}

/// Checks whether `event` is allowed by the given state set.
///
/// Returns `Ok(())` on success, [`Rejection::MissingAuthEvent`] when an auth
/// event the candidate cites is absent from the state set, and
/// [`Rejection::NotAllowed`] on a policy rejection.
pub fn check_allowed_by_state(event: &Pdu, state: &[Pdu]) -> Result<(), Rejection> {
    check_allowed_by_state_with(event, state, &HashSet::new())
}

/// Like [`check_allowed_by_state`], additionally accepting cited auth events
/// in `vouched`: events that were fetched, verified and committed separately
/// after an earlier check reported them missing. The policy evaluation still
/// runs against the state set alone.
pub fn check_allowed_by_state_with(
    event: &Pdu,
    state: &[Pdu],
    vouched: &HashSet<OwnedEventId>,
) -> Result<(), Rejection> {
    let known_ids: HashSet<&OwnedEventId> = state.iter().map(|s| &s.event_id).collect();
    for auth_id in &event.auth_events {
        if !known_ids.contains(auth_id) && !vouched.contains(auth_id) {
            return Err(Rejection::MissingAuthEvent(auth_id.clone()));
        }
    }

    let index = AuthIndex::from_state(state)?;
    authorize(event, &index)
}

/// Evaluates the authorization predicate for `event` against an auth index
fn authorize(event: &Pdu, index: &AuthIndex<'_>) -> Result<(), Rejection> {
    let deny = |reason: &str| {
        Err(Rejection::not_allowed(event.event_id.clone(), reason))
    };

    if event.kind == ROOM_CREATE {
        // The create event is the root of the room graph; it cites nothing.
        if !event.prev_events.is_empty() || !event.auth_events.is_empty() {
            return deny("create event must not cite parents");
        }
        return Ok(());
    }

    let Some(create) = index.get(ROOM_CREATE, "") else {
        return deny("state set has no create event");
    };
    if create.room_id != event.room_id {
        return deny("state set belongs to a different room");
    }

    let power_levels = power_levels_of(index, create)?;
    let sender_power = user_power(&power_levels, create, event.sender.as_str());

    if event.kind == ROOM_MEMBER {
        return authorize_membership(event, index, &power_levels, create, sender_power);
    }

    if membership_of(index, &event.sender) != Some(MEMBERSHIP_JOIN.to_owned()) {
        return deny("sender is not joined to the room");
    }

    let required = required_power(&power_levels, event);
    if sender_power < required {
        trace!(
            event_id = %event.event_id,
            sender_power,
            required,
            "power level check failed"
        );
        return deny("sender lacks the power to send this event");
    }

    Ok(())
}

fn authorize_membership(
    event: &Pdu,
    index: &AuthIndex<'_>,
    power_levels: &PowerLevelsContent,
    create: &Pdu,
    sender_power: i64,
) -> Result<(), Rejection> {
    let deny = |reason: &str| {
        Err(Rejection::not_allowed(event.event_id.clone(), reason))
    };

    let Some(target) = event.state_key.as_deref() else {
        return deny("membership event without state_key");
    };
    let Ok(target_user) = UserId::parse(target) else {
        return deny("membership event state_key is not a user id");
    };

    let content: MemberContent = serde_json::from_str(event.content.get())
        .map_err(|_| Rejection::not_allowed(event.event_id.clone(), "invalid membership content"))?;

    let sender_is_target = event.sender.as_str() == target;
    let target_membership = membership_of(index, &target_user);
    let target_power = user_power(power_levels, create, target);

    match content.membership.as_str() {
        MEMBERSHIP_JOIN => {
            if !sender_is_target {
                return deny("cannot join on behalf of another user");
            }
            if target_membership.as_deref() == Some(MEMBERSHIP_BAN) {
                return deny("user is banned from the room");
            }
            let join_rule = join_rule_of(index);
            let already_invited_or_joined = matches!(
                target_membership.as_deref(),
                Some(MEMBERSHIP_INVITE) | Some(MEMBERSHIP_JOIN)
            );
            let is_creator_join = event
                .prev_events
                .iter()
                .any(|prev| prev == &create.event_id)
                && creator_of(create).as_deref() == Some(event.sender.as_str());
            if join_rule == "public" || already_invited_or_joined || is_creator_join {
                Ok(())
            } else {
                deny("room is not public and user was not invited")
            }
        }
        MEMBERSHIP_INVITE => {
            if membership_of(index, &event.sender).as_deref() != Some(MEMBERSHIP_JOIN) {
                return deny("inviter is not joined to the room");
            }
            if matches!(
                target_membership.as_deref(),
                Some(MEMBERSHIP_JOIN) | Some(MEMBERSHIP_BAN)
            ) {
                return deny("target cannot be invited in their current membership");
            }
            if sender_power < power_levels.invite {
                return deny("sender lacks the power to invite");
            }
            Ok(())
        }
        MEMBERSHIP_LEAVE => {
            if sender_is_target {
                return match target_membership.as_deref() {
                    Some(MEMBERSHIP_JOIN) | Some(MEMBERSHIP_INVITE) => Ok(()),
                    _ => deny("user is not in the room"),
                };
            }
            if membership_of(index, &event.sender).as_deref() != Some(MEMBERSHIP_JOIN) {
                return deny("kicker is not joined to the room");
            }
            if sender_power < power_levels.kick || sender_power <= target_power {
                return deny("sender lacks the power to kick this user");
            }
            Ok(())
        }
        MEMBERSHIP_BAN => {
            if membership_of(index, &event.sender).as_deref() != Some(MEMBERSHIP_JOIN) {
                return deny("sender is not joined to the room");
            }
            if sender_power < power_levels.ban || sender_power <= target_power {
                return deny("sender lacks the power to ban this user");
            }
            Ok(())
        }
        other => deny(&format!("unknown membership {other:?}")),
    }
}

/// Power level required to send `event` under the given power levels
fn required_power(power_levels: &PowerLevelsContent, event: &Pdu) -> i64 {
    if let Some(level) = power_levels.events.get(&event.kind) {
        return *level;
    }
    if event.state_key.is_some() {
        power_levels.state_default
    } else {
        power_levels.events_default
    }
}

/// Effective power of a user. Without a power levels event, the room
/// creator holds 100 and everyone else the default.
fn user_power(power_levels: &PowerLevelsContent, create: &Pdu, user: &str) -> i64 {
    if let Some(level) = power_levels.users.get(user) {
        return *level;
    }
    if power_levels.users.is_empty() && creator_of(create).as_deref() == Some(user) {
        return 100;
    }
    power_levels.users_default
}

fn membership_of(index: &AuthIndex<'_>, user: &UserId) -> Option<String> {
    let event = index.get(ROOM_MEMBER, user.as_str())?;
    serde_json::from_str::<MemberContent>(event.content.get())
        .ok()
        .map(|content| content.membership)
}

fn join_rule_of(index: &AuthIndex<'_>) -> String {
    index
        .get(ROOM_JOIN_RULES, "")
        .and_then(|event| serde_json::from_str::<JoinRulesContent>(event.content.get()).ok())
        .map(|content| content.join_rule)
        .unwrap_or_else(|| "invite".to_owned())
}

/// The room creator: the explicit content field when present, the create
/// event's sender otherwise (newer room versions drop the field).
fn creator_of(create: &Pdu) -> Option<String> {
    match serde_json::from_str::<CreateContent>(create.content.get()) {
        Ok(CreateContent {
            creator: Some(creator),
        }) => Some(creator),
        _ => Some(create.sender.to_string()),
    }
}

fn power_levels_of<'a>(
    index: &AuthIndex<'a>,
    _create: &Pdu,
) -> Result<PowerLevelsContent, Rejection> {
    match index.get(ROOM_POWER_LEVELS, "") {
        Some(event) => serde_json::from_str(event.content.get()).map_err(|_| {
            Rejection::InvalidEvent(format!(
                "power levels event {} has invalid content",
                event.event_id
            ))
        }),
        None => Ok(PowerLevelsContent::default()),
    }
}
