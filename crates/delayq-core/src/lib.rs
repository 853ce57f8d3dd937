//! Core types and utilities for the delayq delayed-message engine.
//!
//! This crate provides the building blocks shared by the storage engine and
//! the replication layer:
//! - Configuration management
//! - Error types for engine operations
//! - Common value types (delayed-message categories, id generation)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, QueueConfig};
pub use error::{Error, Result};
pub use types::{DelayedType, IdGenerator, MessageId, SeqIdGenerator};
