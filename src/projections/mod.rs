//! Projections: named, recoverable materialized views over a channel.
//!
//! A projection folds the events of one channel into keyed documents in a
//! binder. Each registered projection owns one subscription; its handler
//! reads the target document, applies the event, writes the document back
//! and then records the event's sequence number as the projection's
//! checkpoint. On start the projection resumes right after its checkpoint,
//! so restarts never redeliver events that were fully applied.
//!
//! The one window in which the document and checkpoint disagree is a crash
//! between the two writes; the event is then applied once more on restart,
//! which is harmless for an idempotent apply function.
//!
//! # Example
//!
//! ```ignore
//! let definition = ProjectionDefinition::builder("basket-totals")
//!     .channel("orders")
//!     .binder("baskets")
//!     .id_selector(|ev| ev.payload.get_str("basketId").map(DocumentId::from))
//!     .apply(|doc, ev| doc.with("total", ev.payload.get_u64("amount").unwrap_or(0)))
//!     .build()?;
//!
//! let projection = manager.create_projection(definition)?;
//! ```

mod checkpoint;
mod definition;
mod manager;
mod worker;

pub use checkpoint::{CheckpointStore, CHECKPOINT_BINDER};
pub use definition::{
    ApplyError, ApplyFn, EventFilter, IdSelector, ProjectionBuilder, ProjectionDefinition,
};
pub use manager::{Projection, ProjectionManager, ProjectionState, ProjectionStatus};
