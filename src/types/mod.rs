//! Public types for the Skald API.

mod event;
mod params;
mod record;
mod request;
mod usage;

pub use event::{StreamEvent, now_timestamp};
pub use params::ModelParams;
pub use record::{ExecutionRecord, ExecutionStatus};
pub use request::{ExecutionRequest, ExecutionResult, InputFields};
pub use usage::TokenUsage;
