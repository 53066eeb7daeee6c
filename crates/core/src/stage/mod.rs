//! Stage state machine: retry/timeout policy and pure transitions.

mod policy;
mod transition;

pub use policy::{PolicyVerdict, RetryPolicy, StagePolicies};
pub use transition::{
    apply_failure, apply_poll, apply_resubmission, apply_submission, consume_retry,
    read_time_correction, Correction, PollEffect, PollOutcome, PollTransition, StageOutput,
};
