// =============================================================================
// Matrixon Inbound Federation - Config Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the configuration structure and validation logic for
// the inbound federation processor and the public rooms consumer. Loading
// configuration from disk is the embedding server's concern; this crate only
// consumes a validated instance.
//
// =============================================================================

use std::time::Duration;

use ruma::OwnedServerName;
use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};

/// Inbound federation processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Server name of this Matrixon instance; used as the transaction
    /// destination and must never appear as an origin
    pub server_name: OwnedServerName,

    /// Outer deadline for processing one inbound transaction, milliseconds
    pub transaction_timeout_ms: u64,

    /// Deadline for a single outbound federation call, milliseconds
    pub remote_timeout_ms: u64,

    /// Timeout handed to the EDU producer for typing forwards, milliseconds
    pub typing_timeout_ms: u64,

    /// Maximum number of events requested from /get_missing_events
    pub missing_events_limit: u32,

    /// How far below the current room depth /get_missing_events may reach
    pub min_depth_window: i64,

    /// Maximum recursion depth while resolving missing prev or auth events
    pub max_recursion_depth: u32,

    /// Cumulative outbound federation calls allowed per transaction
    pub federation_call_budget: u32,

    /// Room server output log topic consumed by the public rooms projector
    pub output_topic: String,

    /// Delay before the consumer retries a failed message, milliseconds
    pub consumer_retry_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            server_name: OwnedServerName::try_from("localhost")
                .expect("static server name is valid"),
            transaction_timeout_ms: 60_000,
            remote_timeout_ms: 10_000,
            typing_timeout_ms: 30_000,
            missing_events_limit: 20,
            min_depth_window: 20,
            max_recursion_depth: 10,
            federation_call_budget: 50,
            output_topic: "roomserver_output".to_owned(),
            consumer_retry_ms: 1_000,
        }
    }
}

impl ProcessorConfig {
    /// Creates a new configuration for the given server name
    pub fn new(server_name: OwnedServerName) -> Self {
        Self {
            server_name,
            ..Self::default()
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.transaction_timeout_ms == 0 {
            return Err(FederationError::config(
                "transaction timeout must be greater than 0",
            ));
        }

        if self.remote_timeout_ms == 0 {
            return Err(FederationError::config(
                "remote call timeout must be greater than 0",
            ));
        }

        if self.remote_timeout_ms > self.transaction_timeout_ms {
            return Err(FederationError::config(
                "remote call timeout cannot exceed the transaction timeout",
            ));
        }

        if self.typing_timeout_ms == 0 {
            return Err(FederationError::config(
                "typing timeout must be greater than 0",
            ));
        }

        if self.missing_events_limit == 0 {
            return Err(FederationError::config(
                "missing events limit must be greater than 0",
            ));
        }

        if self.max_recursion_depth == 0 {
            return Err(FederationError::config(
                "recursion depth must be greater than 0",
            ));
        }

        if self.federation_call_budget == 0 {
            return Err(FederationError::config(
                "federation call budget must be greater than 0",
            ));
        }

        if self.output_topic.is_empty() {
            return Err(FederationError::config("output topic cannot be empty"));
        }

        Ok(())
    }

    /// Gets the outer transaction deadline
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Gets the per-remote-call deadline
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Gets the typing forward timeout
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    /// Gets the consumer retry backoff
    pub fn consumer_retry(&self) -> Duration {
        Duration::from_millis(self.consumer_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_default_config() {
        let config = ProcessorConfig::default();
        assert_eq!(config.server_name.as_str(), "localhost");
        assert_eq!(config.typing_timeout_ms, 30_000);
        assert_eq!(config.missing_events_limit, 20);
        assert_eq!(config.min_depth_window, 20);
        assert_eq!(config.max_recursion_depth, 10);
        assert_eq!(config.federation_call_budget, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_config() {
        let name = OwnedServerName::try_from("matrixon.example.org").unwrap();
        let config = ProcessorConfig::new(name.clone());
        assert_eq!(config.server_name, name);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = ProcessorConfig::default();
        config.transaction_timeout_ms = 0;
        assert!(config.validate().is_err());

        config = ProcessorConfig::default();
        config.remote_timeout_ms = 0;
        assert!(config.validate().is_err());

        config = ProcessorConfig::default();
        config.missing_events_limit = 0;
        assert!(config.validate().is_err());

        config = ProcessorConfig::default();
        config.federation_call_budget = 0;
        assert!(config.validate().is_err());

        config = ProcessorConfig::default();
        config.output_topic = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = ProcessorConfig::default();
        config.remote_timeout_ms = config.transaction_timeout_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = ProcessorConfig::default();
        assert_eq!(config.typing_timeout(), Duration::from_secs(30));
        assert_eq!(config.transaction_timeout(), Duration::from_secs(60));
    }
}
