use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// State of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    /// Explicitly marked by an operator not to be pursued.
    Blocked,
    /// Not eligible until `precondition_date` has passed.
    WaitingForDate,
    /// Date passed; still waiting on other goals per the mode.
    WaitingForPreconditions,
    /// Eligible; awaiting dispatch, ordered by deadline.
    WaitingForWorker,
    /// Terminal success.
    Achieved,
    /// Terminal failure: too many attempts, or explicit.
    GivenUp,
    /// A precondition failed and the failure behavior is `block`.
    NotGoingToHappenSoon,
}

impl GoalState {
    /// States a goal can be in while still making normal forward progress.
    pub const WAITING: [GoalState; 3] = [
        GoalState::WaitingForDate,
        GoalState::WaitingForPreconditions,
        GoalState::WaitingForWorker,
    ];

    /// States that count toward dependents' `waiting_for_failed_count`.
    pub const NOT_GOING_TO_HAPPEN_SOON: [GoalState; 3] = [
        GoalState::Blocked,
        GoalState::GivenUp,
        GoalState::NotGoingToHappenSoon,
    ];

    /// True for the waiting states (date, preconditions, worker).
    pub fn is_waiting(self) -> bool {
        Self::WAITING.contains(&self)
    }

    /// True for the failure-like states that block dependents.
    pub fn is_failure_like(self) -> bool {
        Self::NOT_GOING_TO_HAPPEN_SOON.contains(&self)
    }
}

impl fmt::Display for GoalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocked => "blocked",
            Self::WaitingForDate => "waiting_for_date",
            Self::WaitingForPreconditions => "waiting_for_preconditions",
            Self::WaitingForWorker => "waiting_for_worker",
            Self::Achieved => "achieved",
            Self::GivenUp => "given_up",
            Self::NotGoingToHappenSoon => "not_going_to_happen_soon",
        };
        f.write_str(s)
    }
}

impl FromStr for GoalState {
    type Err = GoalStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "waiting_for_date" => Ok(Self::WaitingForDate),
            "waiting_for_preconditions" => Ok(Self::WaitingForPreconditions),
            "waiting_for_worker" => Ok(Self::WaitingForWorker),
            "achieved" => Ok(Self::Achieved),
            "given_up" => Ok(Self::GivenUp),
            "not_going_to_happen_soon" => Ok(Self::NotGoingToHappenSoon),
            other => Err(GoalStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GoalState`] string.
#[derive(Debug, Clone)]
pub struct GoalStateParseError(pub String);

impl fmt::Display for GoalStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid goal state: {:?}", self.0)
    }
}

impl std::error::Error for GoalStateParseError {}

// ---------------------------------------------------------------------------

/// How a goal's preconditions combine: all must be achieved, or any one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PreconditionsMode {
    All,
    Any,
}

impl fmt::Display for PreconditionsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for PreconditionsMode {
    type Err = PreconditionsModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(PreconditionsModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PreconditionsMode`] string.
#[derive(Debug, Clone)]
pub struct PreconditionsModeParseError(pub String);

impl fmt::Display for PreconditionsModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid preconditions mode: {:?}", self.0)
    }
}

impl std::error::Error for PreconditionsModeParseError {}

// ---------------------------------------------------------------------------

/// What happens to a goal when one of its preconditions fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PreconditionFailureBehavior {
    /// The goal becomes `not_going_to_happen_soon`.
    Block,
    /// The failed precondition counts as satisfied.
    Proceed,
}

impl fmt::Display for PreconditionFailureBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "block",
            Self::Proceed => "proceed",
        };
        f.write_str(s)
    }
}

impl FromStr for PreconditionFailureBehavior {
    type Err = PreconditionFailureBehaviorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "proceed" => Ok(Self::Proceed),
            other => Err(PreconditionFailureBehaviorParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PreconditionFailureBehavior`] string.
#[derive(Debug, Clone)]
pub struct PreconditionFailureBehaviorParseError(pub String);

impl fmt::Display for PreconditionFailureBehaviorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid precondition failure behavior: {:?}", self.0)
    }
}

impl std::error::Error for PreconditionFailureBehaviorParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A goal -- one durable unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Goal {
    pub id: Uuid,
    pub state: GoalState,
    /// Name resolved against the handler registry at dispatch time.
    pub handler: String,
    /// Opaque JSON passed to the handler (`{"args": [...], "kwargs": {...}}`).
    pub instructions: Option<serde_json::Value>,
    pub precondition_date: DateTime<Utc>,
    pub preconditions_mode: PreconditionsMode,
    pub precondition_failure_behavior: PreconditionFailureBehavior,
    pub waiting_for_count: i32,
    pub waiting_for_not_achieved_count: i32,
    pub waiting_for_failed_count: i32,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An edge in the goal dependency DAG: `dependent_goal` waits on
/// `precondition_goal`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GoalDependency {
    pub id: Uuid,
    pub dependent_goal: Uuid,
    pub precondition_goal: Uuid,
}

/// One handler invocation: outcome, duration and a short message.
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GoalProgress {
    pub id: Uuid,
    pub goal: Uuid,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub time_taken_ms: Option<i64>,
    pub message: String,
}

/// One in-flight handler invocation, recorded outside the dispatch
/// transaction so crashes mid-handler remain visible.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GoalPickup {
    pub id: Uuid,
    pub goal: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
