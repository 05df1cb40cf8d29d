//! # Eventide
//!
//! An event-sourcing substrate: append-only, per-channel event logs with
//! resumable ordered replay, and projections that fold those events into
//! queryable documents with crash-recoverable progress.
//!
//! ## Core Concepts
//!
//! - **Channels**: Named, totally ordered event streams numbered from 0
//!   without gaps
//! - **Subscriptions**: Ordered replay from a start policy with a bounded
//!   queue between reader and handler
//! - **Binders**: Keyed document storage for projected output
//! - **Projections**: Named views resuming after their durable checkpoint
//!
//! ## Example
//!
//! ```ignore
//! use eventide::{Document, DocumentId, Engine, EngineConfig, ProjectionDefinition};
//!
//! let engine = Engine::open(EngineConfig::file("./data"))?;
//!
//! engine.create_projection(
//!     ProjectionDefinition::builder("basket-totals")
//!         .channel("orders")
//!         .binder("baskets")
//!         .id_selector(|ev| ev.payload.get_str("basketId").map(DocumentId::from))
//!         .apply(|doc, ev| doc.with("total", ev.payload.get_u64("amount").unwrap_or(0)))
//!         .build()?,
//! )?;
//!
//! engine.publish("orders", Document::new().with("basketId", "b1").with("amount", 10))?;
//!
//! let basket = engine.binder("baskets")?.get(&"b1".into())?;
//! ```

pub mod binders;
pub mod channels;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
mod lock;
pub mod log;
pub mod projections;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use binders::{Binder, DocumentScan, DocumentStore, FileDocumentStore, MemoryDocumentStore};
pub use channels::{AppendOutcome, ChannelStore, FileChannelStore, MemoryChannelStore};
pub use config::{BackendConfig, EngineConfig, FailurePolicy, FilteredEvents, ProjectionConfig};
pub use document::Document;
pub use engine::Engine;
pub use error::{EngineError, Result, WriteStage};
pub use log::{EventEnvelope, EventLog, LogConfig, VerifyReport};
pub use projections::{
    ApplyError, CheckpointStore, Projection, ProjectionDefinition, ProjectionManager,
    ProjectionState, ProjectionStatus,
};
pub use subscriptions::{
    EventHandler, Subscription, SubscriptionConfig, SubscriptionId, SubscriptionState,
};
pub use types::*;
