//! Fault checkpoints bracketing every protocol step
//!
//! A checkpoint armed with an action fires once: the next time the node
//! reaches it, the action is taken and the checkpoint is disarmed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Checkpoint {
    /// Before a reservation request is forwarded downstream
    BeforeAskReserve,
    /// After a node reserved, before it approves upstream
    AfterReserve,
    /// Before the coordinator distributes the path configuration
    BeforePathConfiguration,
    /// Before a vote is requested or answered
    BeforeVote,
    /// After a participant signed, before it answers
    AfterVote,
    /// Before the signature set is broadcast
    BeforeVoteConsistency,
    /// After the coordinator persisted the signature set
    AfterVotesCollected,
    /// Before the outcome is applied locally
    BeforeCommit,
    /// Before each recovery poll
    BeforeRecoveryPoll,
}

/// What happens when an armed checkpoint is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultAction {
    /// The next protocol message is not sent or not answered
    LoseMessage,
    /// The handler fails
    Exception,
    /// The node is killed by its supervisor
    Terminate,
}

/// Armed checkpoints of one node
#[derive(Debug, Default)]
pub struct FaultPlan {
    armed: Mutex<HashMap<Checkpoint, FaultAction>>,
}

impl FaultPlan {
    /// Create an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a checkpoint, replacing any previous action
    pub fn arm(&self, checkpoint: Checkpoint, action: FaultAction) {
        tracing::info!(?checkpoint, ?action, "Fault armed");
        self.armed.lock().insert(checkpoint, action);
    }

    /// Disarm every checkpoint
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// Fire a checkpoint, disarming it
    pub fn take(&self, checkpoint: Checkpoint) -> Option<FaultAction> {
        self.armed.lock().remove(&checkpoint)
    }

    /// Check whether a checkpoint is armed
    pub fn is_armed(&self, checkpoint: Checkpoint) -> bool {
        self.armed.lock().contains_key(&checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_fires_once() {
        let plan = FaultPlan::new();
        plan.arm(Checkpoint::BeforeVote, FaultAction::LoseMessage);
        assert!(plan.is_armed(Checkpoint::BeforeVote));

        assert_eq!(plan.take(Checkpoint::BeforeVote), Some(FaultAction::LoseMessage));
        assert_eq!(plan.take(Checkpoint::BeforeVote), None);
    }

    #[test]
    fn test_clear() {
        let plan = FaultPlan::new();
        plan.arm(Checkpoint::AfterReserve, FaultAction::Exception);
        plan.arm(Checkpoint::BeforeCommit, FaultAction::Terminate);
        plan.clear();
        assert_eq!(plan.take(Checkpoint::AfterReserve), None);
        assert_eq!(plan.take(Checkpoint::BeforeCommit), None);
    }
}
