// =============================================================================
// Matrixon Inbound Federation - Processor Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Per-event orchestration: fetch the state at the event, authorize it, and
// commit it to the room server. When prev events are missing the processor
// recurses through the missing-events resolver and the remote state ladder.
// Recursion depth and the outbound federation call budget are both bounded
// so a hostile room graph cannot run the server out of work.
//
// =============================================================================

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use ruma::{OwnedEventId, OwnedServerName};
use tracing::{debug, warn};

use crate::{
    auth,
    config::ProcessorConfig,
    error::{FederationError, Rejection, TransientError},
    missing::MissingEventsOutcome,
    traits::{FederationTransport, KeyRing, RoomServerApi},
    types::{HeaderedPdu, Pdu, SendPolicy},
};

/// Boxed future type for the recursive processing paths
pub(crate) type AsyncRecursive<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Processes single events against the room server, filling gaps in room
/// history over federation as needed.
///
/// One processor instance serves one inbound transaction: the origin server
/// and the federation call budget are per-transaction state.
pub struct EventProcessor {
    pub(crate) room_server: Arc<dyn RoomServerApi>,
    pub(crate) federation: Arc<dyn FederationTransport>,
    pub(crate) keyring: Arc<dyn KeyRing>,
    pub(crate) origin: OwnedServerName,
    pub(crate) config: Arc<ProcessorConfig>,
    federation_calls: AtomicU32,
}

impl EventProcessor {
    /// Creates a processor bound to one transaction's origin server
    pub fn new(
        room_server: Arc<dyn RoomServerApi>,
        federation: Arc<dyn FederationTransport>,
        keyring: Arc<dyn KeyRing>,
        origin: OwnedServerName,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self {
            room_server,
            federation,
            keyring,
            origin,
            config,
            federation_calls: AtomicU32::new(0),
        }
    }

    /// Charges one outbound federation call against the transaction budget
    pub(crate) fn charge_remote_call(&self) -> Result<(), TransientError> {
        let used = self.federation_calls.fetch_add(1, Ordering::Relaxed);
        if used >= self.config.federation_call_budget {
            return Err(TransientError::BudgetExhausted(
                self.config.federation_call_budget,
            ));
        }
        Ok(())
    }

    /// Processes one event: state lookup, authorization, commit.
    ///
    /// `is_inbound_txn` is true only for events pushed to us directly in the
    /// current transaction; it controls how failures of the missing-events
    /// fallback are classified (see the resolver). `depth` tracks recursion
    /// through missing prev and auth events.
    pub fn process_event(
        &self,
        event: HeaderedPdu,
        is_inbound_txn: bool,
        depth: u32,
    ) -> AsyncRecursive<'_, Result<(), FederationError>> {
        Box::pin(async move {
            if depth > self.config.max_recursion_depth {
                return Err(
                    TransientError::RecursionLimit(self.config.max_recursion_depth).into(),
                );
            }

            let state = self
                .room_server
                .query_state_after_events(&event.event.room_id, &event.event.prev_events)
                .await?;

            if !state.room_exists {
                return Err(Rejection::RoomNotFound(event.event.room_id.clone()).into());
            }

            if !state.prev_events_exist {
                return self
                    .process_event_with_missing_state(event, is_inbound_txn, depth)
                    .await;
            }

            let state_events: Vec<Pdu> = state
                .state_events
                .into_iter()
                .map(|headered| headered.event)
                .collect();
            auth::check_allowed_by_state(&event.event, &state_events)?;

            debug!(event_id = %event.event.event_id, "event allowed by local state, committing");
            self.room_server
                .send_events(vec![event], SendPolicy::DoNotSendToOtherServers)
                .await?;
            Ok(())
        })
    }

    /// Handles an event whose prev events are not all known locally.
    ///
    /// First tries to close the gap via /get_missing_events; if that cannot
    /// help, fetches the state at the event from the origin and authorizes
    /// against it, resolving missing auth events recursively with a bounded
    /// retry loop.
    pub(crate) fn process_event_with_missing_state(
        &self,
        event: HeaderedPdu,
        is_inbound_txn: bool,
        depth: u32,
    ) -> AsyncRecursive<'_, Result<(), FederationError>> {
        Box::pin(async move {
            match self
                .get_missing_events(&event, is_inbound_txn, depth)
                .await?
            {
                MissingEventsOutcome::Filled => {
                    // The gap is closed; the event goes back through the
                    // normal path, which now finds its prev events.
                    return self.process_event(event, is_inbound_txn, depth + 1).await;
                }
                MissingEventsOutcome::NeedState => {}
            }

            let resp_state = match self.lookup_state_via_state_ids(&event).await {
                Ok(state) => state,
                Err(FederationError::Rejection(rejection)) => {
                    // A forged or corrupt event inside the /state_ids
                    // response; the full /state would contain it too.
                    return Err(rejection.into());
                }
                Err(err) => {
                    warn!(
                        event_id = %event.event.event_id,
                        error = %err,
                        "/state_ids lookup failed, falling back to /state"
                    );
                    self.lookup_state_via_state(&event).await?
                }
            };

            // Authorization with bounded recovery: a missing auth event is
            // located in the fetched state response, processed through this
            // same path, and the check reruns with that event vouched for.
            // Every retry either vouches a new event ID or fails for good.
            let mut vouched: HashSet<OwnedEventId> = HashSet::new();
            let mut attempts = 0u32;
            loop {
                match auth::check_allowed_by_state_with(
                    &event.event,
                    &resp_state.state_events,
                    &vouched,
                ) {
                    Ok(()) => break,
                    Err(Rejection::MissingAuthEvent(missing_id)) => {
                        attempts += 1;
                        if attempts > self.config.max_recursion_depth
                            || vouched.contains(&missing_id)
                        {
                            return Err(Rejection::MissingAuthEvent(missing_id).into());
                        }

                        let Some(found) = resp_state
                            .auth_events
                            .iter()
                            .find(|candidate| candidate.event_id == missing_id)
                            .cloned()
                        else {
                            return Err(Rejection::MissingAuthEvent(missing_id).into());
                        };

                        debug!(
                            event_id = %event.event.event_id,
                            auth_event_id = %missing_id,
                            "fetching missing auth event before retrying authorization"
                        );
                        self.process_event_with_missing_state(
                            found.headered(event.room_version.clone()),
                            is_inbound_txn,
                            depth + 1,
                        )
                        .await?;

                        vouched.insert(missing_id);
                    }
                    Err(rejection) => return Err(rejection.into()),
                }
            }

            debug!(
                event_id = %event.event.event_id,
                "event allowed by fetched state, committing with state"
            );
            self.room_server
                .send_event_with_state(resp_state, event)
                .await?;
            Ok(())
        })
    }
}
