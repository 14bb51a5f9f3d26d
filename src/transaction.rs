// =============================================================================
// Matrixon Inbound Federation - Transaction Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// The transaction processor. Decodes every PDU of an inbound transaction
// under its room's version, verifies signatures, then drives the event
// processor across the batch in sender order, aggregating per-event results.
// Event-intrinsic rejections are reported and skipped; anything the server
// cannot come to a verdict on aborts the batch so the origin retries.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use ruma::OwnedRoomId;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    config::ProcessorConfig,
    edu,
    error::{FederationError, Result},
    processor::EventProcessor,
    traits::{EduProducer, FederationTransport, KeyRing, RoomServerApi},
    types::{HeaderedPdu, PduResult, RespSend, Transaction},
    validation,
};

/// Room ID extraction before the room version is known
#[derive(Debug, Deserialize)]
struct RoomIdHeader {
    room_id: OwnedRoomId,
}

/// Drives one inbound federation transaction end to end
pub struct TransactionProcessor {
    processor: EventProcessor,
    edu_producer: Arc<dyn EduProducer>,
    config: Arc<ProcessorConfig>,
}

impl TransactionProcessor {
    /// Creates a processor for one transaction from `origin`
    pub fn new(
        room_server: Arc<dyn RoomServerApi>,
        federation: Arc<dyn FederationTransport>,
        keyring: Arc<dyn KeyRing>,
        edu_producer: Arc<dyn EduProducer>,
        origin: ruma::OwnedServerName,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self {
            processor: EventProcessor::new(room_server, federation, keyring, origin, config.clone()),
            edu_producer,
            config,
        }
    }

    /// Processes a decoded transaction and returns the per-event result map.
    ///
    /// PDUs are handled sequentially in sender order: later events may
    /// depend on state introduced by earlier ones in the same batch.
    #[instrument(skip_all, fields(origin = %txn.origin, txn_id = %txn.transaction_id))]
    pub async fn process(&self, txn: Transaction) -> Result<RespSend> {
        info!(
            pdus = txn.pdus.len(),
            edus = txn.edus.len(),
            "received transaction"
        );

        let pdus = self.decode_pdus(&txn).await?;

        let mut results: BTreeMap<_, PduResult> = BTreeMap::new();
        for headered in pdus {
            let event_id = headered.event.event_id.clone();
            match self.processor.process_event(headered, true, 0).await {
                Ok(()) => {
                    results.insert(event_id, PduResult::default());
                }
                Err(err) if err.skips_event_only() => {
                    warn!(
                        event_id = %event_id,
                        error = %err,
                        "failed to process incoming federation event, skipping it"
                    );
                    results.insert(
                        event_id,
                        PduResult {
                            error: Some(err.to_string()),
                        },
                    );
                }
                Err(err) => return Err(err),
            }
        }

        edu::process_edus(
            &txn.edus,
            self.edu_producer.as_ref(),
            self.config.typing_timeout(),
        )
        .await;

        info!(processed = results.len(), "processed transaction");
        Ok(RespSend { pdus: results })
    }

    /// Decodes and verifies every PDU of the transaction, preserving sender
    /// order.
    ///
    /// Without a room version an event cannot even be parsed, so an unknown
    /// room — like a parse or signature failure — rejects the whole
    /// transaction before per-event accounting begins. Engine and key ring
    /// outages stay transient so the origin retries instead of dropping the
    /// events forever.
    async fn decode_pdus(&self, txn: &Transaction) -> Result<Vec<HeaderedPdu>> {
        let mut decoded = Vec::with_capacity(txn.pdus.len());
        for raw in &txn.pdus {
            let header: RoomIdHeader = serde_json::from_str(raw.get()).map_err(|err| {
                warn!(error = %err, "failed to extract room id from event");
                FederationError::InvalidTransaction(format!(
                    "unable to extract room_id from event: {err}"
                ))
            })?;

            let room_version = self
                .processor
                .room_server
                .query_room_version(&header.room_id)
                .await?
                .ok_or_else(|| {
                    warn!(room_id = %header.room_id, "transaction carries event for unknown room");
                    FederationError::InvalidTransaction(format!(
                        "room {} not found",
                        header.room_id
                    ))
                })?;

            let pdu = match validation::parse_and_verify(
                raw,
                &room_version,
                self.processor.keyring.as_ref(),
            )
            .await
            {
                Ok(pdu) => pdu,
                Err(FederationError::Rejection(rejection)) => {
                    warn!(error = %rejection, "transaction carries an unverifiable event");
                    return Err(FederationError::InvalidTransaction(rejection.to_string()));
                }
                Err(err) => return Err(err),
            };

            decoded.push(pdu.headered(room_version));
        }
        Ok(decoded)
    }
}
