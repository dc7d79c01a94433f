//! Pull Delivery
//!
//! - `source`: how one topic is pulled ([`PullSource`])
//! - `scheduler`: which topics are pulled, and when ([`PollScheduler`])

mod scheduler;
mod source;

pub use scheduler::{PollConfig, PollOutcome, PollReason, PollScheduler};
pub use source::{HttpPullSource, PullSource, ScriptedPullSource};
