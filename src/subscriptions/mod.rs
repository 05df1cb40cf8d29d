//! Ordered event delivery from a channel to a handler.
//!
//! Each subscription runs two threads:
//! - a reader that waits for the event at its cursor, decodes it and pushes
//!   it onto a bounded queue, never skipping a missing number
//! - a dispatcher that pops envelopes in FIFO order and calls the handler
//!
//! The bounded queue is the backpressure mechanism: a slow handler fills it
//! and the reader blocks instead of buffering without limit.
//!
//! # Example
//!
//! ```ignore
//! let sub = log.subscribe(
//!     "orders",
//!     StartPolicy::FromStart,
//!     |event: EventEnvelope| -> Result<()> {
//!         println!("{} => {:?}", event.sequence, event.payload);
//!         Ok(())
//!     },
//!     SubscriptionConfig::default(),
//! )?;
//!
//! // ...
//! sub.close();
//! if let Some(err) = sub.failure() {
//!     eprintln!("subscription failed: {}", err);
//! }
//! ```

mod subscription;
mod types;

pub use subscription::Subscription;
pub use types::{EventHandler, SubscriptionConfig, SubscriptionId, SubscriptionState};
