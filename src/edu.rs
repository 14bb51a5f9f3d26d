// =============================================================================
// Matrixon Inbound Federation - EDU Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Ephemeral data unit handling. Only typing notifications are forwarded;
// everything else is logged and dropped. EDU failures are deliberately
// invisible to the transaction response, a lost typing indicator is not
// worth a federation retry.
//
// =============================================================================

use std::time::Duration;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::{traits::EduProducer, types::Edu};

/// The only EDU type with a forwarding path
const M_TYPING: &str = "m.typing";

/// Payload of an `m.typing` EDU
#[derive(Debug, Clone, Deserialize)]
struct TypingContent {
    room_id: OwnedRoomId,
    user_id: OwnedUserId,
    typing: bool,
}

/// Forwards the EDUs of a transaction to the EDU producer.
///
/// Never fails: parse and produce errors are logged and swallowed.
pub async fn process_edus(edus: &[Edu], producer: &dyn EduProducer, typing_timeout: Duration) {
    for edu in edus {
        match edu.edu_type.as_str() {
            M_TYPING => {
                let payload: TypingContent = match serde_json::from_str(edu.content.get()) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(error = %err, "failed to parse typing event");
                        continue;
                    }
                };

                debug!(
                    room_id = %payload.room_id,
                    user_id = %payload.user_id,
                    typing = payload.typing,
                    "forwarding typing notification"
                );
                if let Err(err) = producer
                    .send_typing(
                        &payload.user_id,
                        &payload.room_id,
                        payload.typing,
                        typing_timeout,
                    )
                    .await
                {
                    error!(error = %err, "failed to send typing event to the EDU server");
                }
            }
            other => {
                warn!(edu_type = %other, "unhandled edu");
            }
        }
    }
}
