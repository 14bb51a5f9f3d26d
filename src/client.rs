// =============================================================================
// Matrixon Inbound Federation - Client Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// HTTP implementation of the outbound federation transport: the four
// Server-Server API endpoints used to reconcile gaps in room history.
// Request signing is handled by the embedding server's transport layer;
// this client frames requests, enforces per-call deadlines and decodes
// response envelopes.
//
// =============================================================================

use async_trait::async_trait;
use ruma::{EventId, RoomId, ServerName};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, instrument};

use crate::{
    config::ProcessorConfig,
    error::TransientError,
    traits::FederationTransport,
    types::{MissingEventsParams, RawState, RespStateIds},
};

/// Response envelope of `GET /_matrix/federation/v1/event/{eventId}`
#[derive(Debug, Deserialize)]
struct EventResponse {
    #[serde(default)]
    pdus: Vec<Box<RawValue>>,
}

/// Response envelope of `POST /_matrix/federation/v1/get_missing_events/{roomId}`
#[derive(Debug, Deserialize)]
struct MissingEventsResponse {
    #[serde(default)]
    events: Vec<Box<RawValue>>,
}

/// Federation transport over HTTPS
pub struct HttpFederationTransport {
    http: reqwest::Client,
}

impl HttpFederationTransport {
    /// Creates a transport with the configured per-call deadline
    pub fn new(config: &ProcessorConfig) -> Result<Self, TransientError> {
        let http = reqwest::Client::builder()
            .timeout(config.remote_timeout())
            .build()
            .map_err(|err| TransientError::federation(format!("building client: {err}")))?;
        Ok(Self { http })
    }
}

/// Builds a federation URL on the destination server
fn federation_url(destination: &ServerName, path: &str) -> String {
    format!("https://{destination}/_matrix/federation/v1/{path}")
}

fn transport_error(err: reqwest::Error) -> TransientError {
    TransientError::federation(err.to_string())
}

#[async_trait]
impl FederationTransport for HttpFederationTransport {
    #[instrument(skip(self))]
    async fn get_event(
        &self,
        destination: &ServerName,
        event_id: &EventId,
    ) -> Result<Vec<Box<RawValue>>, TransientError> {
        let url = federation_url(destination, &format!("event/{event_id}"));
        debug!(url = %url, "fetching event over federation");

        let response: EventResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(response.pdus)
    }

    #[instrument(skip(self))]
    async fn state_ids(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RespStateIds, TransientError> {
        let url = federation_url(destination, &format!("state_ids/{room_id}"));
        debug!(url = %url, "fetching state ids over federation");

        self.http
            .get(&url)
            .query(&[("event_id", event_id.as_str())])
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)
    }

    #[instrument(skip(self))]
    async fn state(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RawState, TransientError> {
        let url = federation_url(destination, &format!("state/{room_id}"));
        debug!(url = %url, "fetching full state over federation");

        self.http
            .get(&url)
            .query(&[("event_id", event_id.as_str())])
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)
    }

    #[instrument(skip(self, params))]
    async fn missing_events(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        params: MissingEventsParams,
    ) -> Result<Vec<Box<RawValue>>, TransientError> {
        let url = federation_url(destination, &format!("get_missing_events/{room_id}"));
        debug!(
            url = %url,
            limit = params.limit,
            min_depth = params.min_depth,
            "requesting missing events over federation"
        );

        let response: MissingEventsResponse = self
            .http
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(response.events)
    }
}
