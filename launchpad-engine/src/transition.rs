//! The approval/execution state machine.
//!
//! Requests and operations share one transition table; the engine
//! instantiates it for both subject kinds instead of duplicating the
//! lifecycle logic.

use launchpad_models::{Error, RequestStatus, Result};

/// An action that can move a request or operation between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    PipelineTriggerOk,
    PipelineTriggerFail,
    PipelineSucceeded,
    PipelineFailed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::PipelineTriggerOk => "pipeline_trigger_ok",
            Self::PipelineTriggerFail => "pipeline_trigger_fail",
            Self::PipelineSucceeded => "pipeline_callback(success)",
            Self::PipelineFailed => "pipeline_callback(failure)",
        }
    }
}

/// Computes the status an action leads to, or fails with
/// `InvalidTransition` when the action is not legal from `current`.
pub fn next_status(current: RequestStatus, action: Action) -> Result<RequestStatus> {
    use Action::*;
    use RequestStatus::*;

    match (current, action) {
        (PendingApproval, Approve) => Ok(Approved),
        (PendingApproval, Reject) => Ok(Rejected),
        (Approved, PipelineTriggerOk) => Ok(Deploying),
        (Approved, PipelineTriggerFail) => Ok(Failed),
        (Deploying, PipelineSucceeded) => Ok(Completed),
        (Deploying, PipelineFailed) => Ok(Failed),
        (current, action) => Err(Error::InvalidTransition(format!(
            "cannot {} from status '{}'",
            action.as_str(),
            current
        ))),
    }
}
