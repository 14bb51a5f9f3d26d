// =============================================================================
// Matrixon Inbound Federation - State Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Remote state reconciliation. When the room state at an event cannot be
// derived locally, the state is fetched from the origin server: /state_ids
// first (cheap, mostly IDs this server already knows), /state as the
// fallback. Every event obtained this way passes the full signature gate
// before it is trusted.
//
// =============================================================================

use std::collections::HashMap;

use ruma::{OwnedEventId, RoomVersionId};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{FederationError, TransientError},
    processor::EventProcessor,
    types::{HeaderedPdu, Pdu, RespState},
    validation,
};

impl EventProcessor {
    /// Fetches the state at `event` via `/state_ids` plus `/event`.
    ///
    /// The ID lists are first resolved against the room server in bulk; only
    /// the remainder is fetched over federation one event at a time. The
    /// assembled snapshot keeps the order of the `/state_ids` response and is
    /// checked for internal consistency before anyone authorizes against it.
    #[instrument(skip_all, fields(event_id = %event.event.event_id, room_id = %event.event.room_id))]
    pub(crate) async fn lookup_state_via_state_ids(
        &self,
        event: &HeaderedPdu,
    ) -> Result<RespState, FederationError> {
        self.charge_remote_call()?;
        let state_ids = self
            .federation
            .state_ids(&self.origin, &event.event.room_id, &event.event.event_id)
            .await?;

        // Two bulk queries rather than one keeps the parameter lists small.
        let mut have: HashMap<OwnedEventId, Pdu> = HashMap::new();
        for id_list in [&state_ids.pdu_ids, &state_ids.auth_chain_ids] {
            for headered in self.room_server.query_events_by_id(id_list).await? {
                have.insert(headered.event.event_id.clone(), headered.event);
            }
        }

        let missing: Vec<OwnedEventId> = state_ids
            .pdu_ids
            .iter()
            .chain(state_ids.auth_chain_ids.iter())
            .filter(|id| !have.contains_key(*id))
            .cloned()
            .collect();

        info!(
            missing = missing.len(),
            already_have = have.len(),
            total_state = state_ids.pdu_ids.len(),
            total_auth_events = state_ids.auth_chain_ids.len(),
            "fetching missing state at event"
        );

        for missing_id in &missing {
            self.charge_remote_call()?;
            let raw_events = match self.federation.get_event(&self.origin, missing_id).await {
                Ok(raw_events) => raw_events,
                Err(err) => {
                    warn!(event_id = %missing_id, error = %err, "failed to fetch missing event");
                    return Err(err.into());
                }
            };

            for raw in &raw_events {
                let pdu = self
                    .parse_remote_event(raw, &event.room_version, &event.event.room_id)
                    .await?;
                have.insert(pdu.event_id.clone(), pdu);
            }
        }

        let resp_state = RespState {
            state_events: collect_in_order(&state_ids.pdu_ids, &have)?,
            auth_events: collect_in_order(&state_ids.auth_chain_ids, &have)?,
        };
        resp_state.check()?;
        Ok(resp_state)
    }

    /// Fetches the full state at `event` via `/state`.
    ///
    /// Only reached when `/state_ids` failed for a non-event-intrinsic
    /// reason; some servers do not implement the cheaper endpoint.
    #[instrument(skip_all, fields(event_id = %event.event.event_id, room_id = %event.event.room_id))]
    pub(crate) async fn lookup_state_via_state(
        &self,
        event: &HeaderedPdu,
    ) -> Result<RespState, FederationError> {
        self.charge_remote_call()?;
        let raw_state = self
            .federation
            .state(&self.origin, &event.event.room_id, &event.event.event_id)
            .await?;

        debug!(
            state = raw_state.pdus.len(),
            auth_chain = raw_state.auth_chain.len(),
            "verifying full state response"
        );

        let mut state_events = Vec::with_capacity(raw_state.pdus.len());
        for raw in &raw_state.pdus {
            state_events.push(
                self.parse_remote_event(raw, &event.room_version, &event.event.room_id)
                    .await?,
            );
        }

        let mut auth_events = Vec::with_capacity(raw_state.auth_chain.len());
        for raw in &raw_state.auth_chain {
            auth_events.push(
                self.parse_remote_event(raw, &event.room_version, &event.event.room_id)
                    .await?,
            );
        }

        let resp_state = RespState {
            state_events,
            auth_events,
        };
        resp_state.check()?;
        Ok(resp_state)
    }

    /// Runs one remotely fetched event through the signature gate and the
    /// room ID sanity check
    async fn parse_remote_event(
        &self,
        raw: &serde_json::value::RawValue,
        room_version: &RoomVersionId,
        room_id: &ruma::RoomId,
    ) -> Result<Pdu, FederationError> {
        let pdu = validation::parse_and_verify(raw, room_version, self.keyring.as_ref()).await?;
        validation::check_room_id(room_id, &pdu)?;
        Ok(pdu)
    }
}

/// Resolves an ID list against the fetched event map, preserving order
fn collect_in_order(
    ids: &[OwnedEventId],
    have: &HashMap<OwnedEventId, Pdu>,
) -> Result<Vec<Pdu>, TransientError> {
    ids.iter()
        .map(|id| {
            have.get(id)
                .cloned()
                .ok_or_else(|| TransientError::federation(format!("missing state event {id}")))
        })
        .collect()
}
