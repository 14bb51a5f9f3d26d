// =============================================================================
// Matrixon Inbound Federation - Consumer Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// The public rooms projector: a single-task consumer over one partition of
// the room server output log. State deltas carried by new-room-event
// messages are resolved against the room server and applied to the public
// rooms directory. Offsets advance only after a message is fully handled,
// giving at-least-once semantics; the projection itself is idempotent, so
// redelivery is harmless.
//
// =============================================================================

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::ProcessorConfig,
    error::TransientError,
    traits::{DirectoryStore, OffsetStore, OutputLog, RoomServerApi},
    types::{LogMessage, OutputEvent, OutputType, Pdu},
};

/// Projects room server output events into the public rooms directory
pub struct RoomDirectoryConsumer {
    topic: String,
    partition: i32,
    log: Arc<dyn OutputLog>,
    offsets: Arc<dyn OffsetStore>,
    room_server: Arc<dyn RoomServerApi>,
    directory: Arc<dyn DirectoryStore>,
    retry_backoff: std::time::Duration,
}

impl RoomDirectoryConsumer {
    /// Creates a consumer for one topic partition
    pub fn new(
        config: &ProcessorConfig,
        partition: i32,
        log: Arc<dyn OutputLog>,
        offsets: Arc<dyn OffsetStore>,
        room_server: Arc<dyn RoomServerApi>,
        directory: Arc<dyn DirectoryStore>,
    ) -> Self {
        Self {
            topic: config.output_topic.clone(),
            partition,
            log,
            offsets,
            room_server,
            directory,
            retry_backoff: config.consumer_retry(),
        }
    }

    /// Consumes the partition forever, resuming from the persisted offset.
    ///
    /// Returns only if the initial offset cannot be loaded; once running,
    /// failures are retried in place. Cancel by dropping the task.
    #[instrument(skip(self), fields(topic = %self.topic, partition = self.partition))]
    pub async fn run(&self) -> Result<(), TransientError> {
        let mut offset = self
            .offsets
            .load_offset(&self.topic, self.partition)
            .await?
            .unwrap_or(-1);

        info!(offset, "🚀 starting public rooms consumer");

        loop {
            let message = match self
                .log
                .next_message(&self.topic, self.partition, offset)
                .await
            {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "output log poll failed");
                    sleep(self.retry_backoff).await;
                    continue;
                }
            };

            match self.on_message(&message).await {
                Ok(()) => {
                    // Offset persistence follows processing: a crash between
                    // the two replays the message, never skips it.
                    if let Err(err) = self
                        .offsets
                        .save_offset(&self.topic, self.partition, message.offset)
                        .await
                    {
                        warn!(error = %err, offset = message.offset, "failed to persist offset");
                    }
                    offset = message.offset;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        offset = message.offset,
                        "message processing failed, will retry"
                    );
                    sleep(self.retry_backoff).await;
                }
            }
        }
    }

    /// Handles one output log message.
    ///
    /// `Ok(())` advances the offset — including for unparseable payloads,
    /// which are logged and dropped. An error leaves the offset untouched so
    /// the message is redelivered.
    pub(crate) async fn on_message(&self, message: &LogMessage) -> Result<(), TransientError> {
        let output: OutputEvent = match serde_json::from_slice(&message.payload) {
            Ok(output) => output,
            Err(err) => {
                error!(
                    offset = message.offset,
                    error = %err,
                    "roomserver output log: message parse failure, skipping"
                );
                return Ok(());
            }
        };

        if output.kind != OutputType::NewRoomEvent {
            debug!(kind = ?output.kind, "roomserver output log: ignoring output type");
            return Ok(());
        }

        let Some(new_event) = output.new_room_event else {
            warn!(offset = message.offset, "new_room_event payload missing, skipping");
            return Ok(());
        };

        let event = &new_event.event.event;
        info!(
            event_id = %event.event_id,
            room_id = %event.room_id,
            kind = %event.kind,
            "received event from roomserver"
        );

        let adds = self
            .room_server
            .query_events_by_id(&new_event.adds_state_event_ids)
            .await?;
        let removes = self
            .room_server
            .query_events_by_id(&new_event.removes_state_event_ids)
            .await?;

        let adds: Vec<Pdu> = adds.into_iter().map(|headered| headered.event).collect();
        let removes: Vec<Pdu> = removes
            .into_iter()
            .map(|headered| headered.event)
            .collect();

        self.directory.update_room(&adds, &removes).await
    }
}
