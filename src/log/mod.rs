//! The event log: sequence assignment, envelopes and replay start points.

mod envelope;
mod event_log;

pub use envelope::EventEnvelope;
pub use event_log::{EventLog, LogConfig, VerifyReport};
