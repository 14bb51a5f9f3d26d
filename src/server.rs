// =============================================================================
// Matrixon Inbound Federation - Server Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// The HTTP surface of the inbound federation processor: the transaction
// push endpoint. Authentication of the calling server happens in an outer
// layer which injects the verified origin as a request extension; this
// module only frames the envelope, enforces the outer deadline and maps the
// error taxonomy onto Matrix error responses.
//
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::put,
    Extension, Json, Router,
};
use ruma::OwnedServerName;
use serde_json::json;
use tracing::{error, info};

use crate::{
    config::ProcessorConfig,
    error::{FederationError, TransientError},
    traits::{EduProducer, FederationTransport, KeyRing, RoomServerApi},
    transaction::TransactionProcessor,
    types::{Transaction, TransactionBody},
};

/// Shared dependencies of the federation routes
#[derive(Clone)]
pub struct AppState {
    /// Room state engine
    pub room_server: Arc<dyn RoomServerApi>,

    /// Outbound federation transport
    pub federation: Arc<dyn FederationTransport>,

    /// Signing key provider
    pub keyring: Arc<dyn KeyRing>,

    /// Sink for forwarded EDUs
    pub edu_producer: Arc<dyn EduProducer>,

    /// Processor configuration
    pub config: Arc<ProcessorConfig>,
}

/// Verified origin of an authenticated federation request.
///
/// Inserted as a request extension by the server-authentication layer that
/// fronts these routes.
#[derive(Debug, Clone)]
pub struct Origin(pub OwnedServerName);

/// Builds the inbound federation router
pub fn federation_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/_matrix/federation/v1/send/:txn_id",
            put(send_transaction_route),
        )
        .with_state(state)
}

/// # `PUT /_matrix/federation/v1/send/{txnId}`
///
/// Accepts a transaction push from a remote homeserver.
async fn send_transaction_route(
    State(state): State<AppState>,
    Extension(Origin(origin)): Extension<Origin>,
    Path(txn_id): Path<String>,
    body: Bytes,
) -> Response {
    let body: TransactionBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "M_NOT_JSON",
                &format!("The request body could not be decoded into valid JSON. {err}"),
            )
        }
    };

    info!(
        origin = %origin,
        txn_id = %txn_id,
        pdus = body.pdus.len(),
        edus = body.edus.len(),
        "📥 received transaction push"
    );

    let txn = Transaction {
        origin: origin.clone(),
        transaction_id: txn_id,
        destination: state.config.server_name.clone(),
        pdus: body.pdus,
        edus: body.edus,
    };

    let processor = TransactionProcessor::new(
        state.room_server.clone(),
        state.federation.clone(),
        state.keyring.clone(),
        state.edu_producer.clone(),
        origin,
        state.config.clone(),
    );

    match tokio::time::timeout(state.config.transaction_timeout(), processor.process(txn)).await {
        Err(_elapsed) => {
            let err = TransientError::Timeout(state.config.transaction_timeout_ms);
            error!(error = %err, "transaction processing exceeded the outer deadline");
            internal_server_error()
        }
        Ok(Ok(resp)) => (StatusCode::OK, Json(resp)).into_response(),
        Ok(Err(FederationError::InvalidTransaction(message))) => {
            error_response(StatusCode::BAD_REQUEST, "M_BAD_JSON", &message)
        }
        Ok(Err(err)) => {
            // 500s make well-behaved homeservers back off, so they are the
            // last resort for failures only a retry can fix.
            error!(error = %err, "processing transaction failed");
            internal_server_error()
        }
    }
}

fn error_response(status: StatusCode, errcode: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "errcode": errcode,
            "error": message,
        })),
    )
        .into_response()
}

fn internal_server_error() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "M_UNKNOWN",
        "Internal server error",
    )
}
