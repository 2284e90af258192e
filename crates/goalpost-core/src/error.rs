//! Typed errors the engine surfaces to callers.

use goalpost_db::models::GoalState;
use uuid::Uuid;

/// Errors from operator actions that callers are expected to match on.
///
/// Everything else in the engine flows as `anyhow::Error` with context.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The goal is not in a state that permits the requested action
    /// (e.g. `block` on an achieved goal).
    #[error("cannot {action} goal {goal_id} in state {state}")]
    InvalidStateForAction {
        goal_id: Uuid,
        state: GoalState,
        action: &'static str,
    },
}
