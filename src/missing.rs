// =============================================================================
// Matrixon Inbound Federation - Missing Events Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// The missing-events resolver. When an event arrives whose prev events are
// unknown, this server asks the origin for the intermediate events and
// replays them oldest first, closing the gap between the pushed event and
// the forward extremities already in the room graph.
//
// =============================================================================

use tracing::{debug, error, warn};

use crate::{
    error::FederationError,
    processor::EventProcessor,
    types::{HeaderedPdu, MissingEventsParams, Pdu},
    utils, validation,
};

/// How a missing-events resolution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEventsOutcome {
    /// The gap was closed; the caller should retry the event normally
    Filled,

    /// Backfill could not help; the caller should fetch state at the event
    NeedState,
}

impl EventProcessor {
    /// Attempts to close the prev-events gap below `event` using
    /// `/get_missing_events`.
    ///
    /// How a failed remote call is classified depends on who needs the
    /// answer. An event pushed directly in an inbound transaction may become
    /// the only forward extremity of the room; silently dropping into the
    /// state lookup for such an event would let a malicious origin replace
    /// the whole room state ("room hijack"), so the transaction aborts
    /// instead and the origin must retry. During recursive resolution the
    /// event in flight is already anchored by a later event that will be
    /// authorized on its own, so the failure is demoted to a state lookup.
    pub(crate) async fn get_missing_events(
        &self,
        event: &HeaderedPdu,
        is_inbound_txn: bool,
        depth: u32,
    ) -> Result<MissingEventsOutcome, FederationError> {
        let room_id = &event.event.room_id;

        let latest = match self.room_server.query_latest_events_and_state(room_id).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(room_id = %room_id, error = %err, "failed to query latest events");
                return Ok(MissingEventsOutcome::NeedState);
            }
        };

        self.charge_remote_call()?;
        let params = MissingEventsParams {
            limit: self.config.missing_events_limit,
            min_depth: (latest.depth - self.config.min_depth_window).max(0),
            earliest_events: latest.event_ids.clone(),
            latest_events: vec![event.event.event_id.clone()],
        };
        let raw_events = match self
            .federation
            .missing_events(&self.origin, room_id, params)
            .await
        {
            Ok(raw_events) => raw_events,
            Err(err) => {
                if is_inbound_txn {
                    error!(
                        origin = %self.origin,
                        event_id = %event.event.event_id,
                        error = %err,
                        "origin pushed an event but could not supply its prev events, \
                         dropping the transaction until it can"
                    );
                    return Err(err.into());
                }
                warn!(
                    event_id = %event.event.event_id,
                    error = %err,
                    "failed to look up missing events for non-pushed event"
                );
                return Ok(MissingEventsOutcome::NeedState);
            }
        };

        // Verify the bag. One forged member must not wedge the honest path,
        // so event-intrinsic failures shrink the bag instead of aborting.
        let mut bag: Vec<Pdu> = Vec::with_capacity(raw_events.len());
        for raw in &raw_events {
            match validation::parse_and_verify(raw, &event.room_version, self.keyring.as_ref())
                .await
            {
                Ok(pdu) => match validation::check_room_id(room_id, &pdu) {
                    Ok(()) => bag.push(pdu),
                    Err(err) => {
                        warn!(error = %err, "dropping mis-roomed event from /get_missing_events");
                    }
                },
                Err(FederationError::Rejection(err)) => {
                    warn!(error = %err, "dropping invalid event from /get_missing_events");
                }
                Err(err) => return Err(err),
            }
        }

        let path = utils::find_path(&bag, &event.event, &latest.event_ids);
        if path.is_empty() {
            debug!(
                event_id = %event.event.event_id,
                bag = bag.len(),
                "no path to the known extremities through the returned events"
            );
            return Ok(MissingEventsOutcome::NeedState);
        }

        debug!(
            event_id = %event.event.event_id,
            path = path.len(),
            "replaying missing events oldest first"
        );
        for pdu in path {
            self.process_event(pdu.headered(event.room_version.clone()), false, depth + 1)
                .await?;
        }

        Ok(MissingEventsOutcome::Filled)
    }
}
