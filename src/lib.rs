// =============================================================================
// Matrixon Inbound Federation - Library Root
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Inbound federation transaction processing for the Matrixon Matrix
//   NextServer: transaction intake, cryptographic event validation,
//   gap reconciliation across the room DAG, authorization against room
//   state, and projection of committed events into the public rooms
//   directory.
//
// =============================================================================

//! Inbound federation transaction processing for Matrixon.
//!
//! This crate receives transaction pushes from remote homeservers over the
//! Matrix Server-Server API, validates every contained room event, fills
//! gaps in the local view of room history via federation fallbacks, and
//! commits accepted events to the room state engine. A companion consumer
//! projects the room server's output stream into the public rooms
//! directory.
//!
//! The room state engine, the federation transport, the signing key
//! provider and the storage surfaces are all consumed through traits in
//! [`traits`], so the processing pipeline can be wired against production
//! services or in-memory fakes alike.
//!
//! # Processing pipeline
//!
//! ```text
//! remote server
//!     └─> transaction processor ── per event ──> event processor
//!             │                                      ├─> signature gate
//!             │                                      ├─> state fetcher
//!             │                                      ├─> auth checker
//!             │                                      └─> room server commit
//!             └─> EDU forwarding                          │
//!                                                         v
//!                            public rooms directory <── output consumer
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod consumer;
pub mod edu;
pub mod error;
pub mod missing;
pub mod processor;
pub mod server;
pub mod state;
pub mod traits;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod validation;

pub use client::HttpFederationTransport;
pub use config::ProcessorConfig;
pub use consumer::RoomDirectoryConsumer;
pub use error::{FederationError, Rejection, Result, TransientError};
pub use processor::EventProcessor;
pub use server::{federation_routes, AppState, Origin};
pub use transaction::TransactionProcessor;
pub use types::{
    Edu, HeaderedPdu, LatestEvents, LogMessage, MissingEventsParams, NewRoomEvent, OutputEvent,
    OutputType, Pdu, PduResult, RawState, RespSend, RespState, RespStateIds, SendPolicy,
    StateAfterEvents, Transaction, TransactionBody,
};
