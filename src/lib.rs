//! chainview - session and notification fan-out for a blockchain data server
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Sessions
//! - [`session`] - Per-client view: registrations, commands, readiness
//! - [`callback`] - Liveness monitor for a client's push channel
//! - [`ready`] - One-shot readiness gate
//! - [`command`] - Command parsing
//!
//! ## Registry & Pipeline
//! - [`registry`] - Session collection, worker threads, lifecycle
//! - [`session_map`] - Copy-on-write session map
//! - [`notification`] - Store events, per-session packets, callback messages
//! - [`zeroconf`] - Mempool bridge from the store into the pipeline
//!
//! ## Data Store
//! - [`store`] - Store contract and in-memory store
//! - [`types`] - Addresses, transactions, ledger entries
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Sessions
// ============================================================================
pub mod callback;
pub mod command;
pub mod ready;
pub mod session;

// ============================================================================
// Registry & Pipeline
// ============================================================================
pub mod notification;
pub mod registry;
pub mod session_map;
pub mod zeroconf;

// ============================================================================
// Data Store
// ============================================================================
pub mod store;
pub mod types;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::ViewError;
pub use registry::{response_json, RegistryHooks, RegistryState, SessionRegistry};
pub use session::BdvSession;
pub use store::{BlockDataStore, MemoryStore};
