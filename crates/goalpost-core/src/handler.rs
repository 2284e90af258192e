//! Handler resolution and the handler-facing API.
//!
//! A handler is a named unit of user code invoked by dispatch to pursue a
//! goal. Handlers run inside a savepoint of the dispatch transaction and
//! talk back to the engine through [`HandlerContext`] (database access,
//! child-goal scheduling) and [`HandlerOutcome`] (done vs. yield).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use goalpost_db::models::Goal;

use crate::scheduler::{self, ScheduleSpec};
use crate::settings::EngineSettings;

/// What a handler asks the engine to do next.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The goal is achieved.
    AllDone,
    /// Yield: reschedule me, optionally after a date and behind new
    /// precondition goals.
    RetryMeLater(RetryMeLater),
}

/// Payload of a yield, either returned or raised as
/// [`RetryMeLaterError`].
#[derive(Debug, Default)]
pub struct RetryMeLater {
    /// Do not pick me up again before this instant. The engine takes the
    /// max of this and the goal's current precondition date.
    pub precondition_date: Option<DateTime<Utc>>,
    /// Goals that must settle before I run again, as observed by the
    /// handler. The engine re-checks their states under lock.
    pub precondition_goals: Vec<Goal>,
    /// Short progress message stored with the progress row.
    pub message: String,
}

impl RetryMeLater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, date: DateTime<Utc>) -> Self {
        self.precondition_date = Some(date);
        self
    }

    pub fn behind(mut self, goals: Vec<Goal>) -> Self {
        self.precondition_goals = goals;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// The exceptional form of a yield. Dispatch normalizes this to the same
/// success path as returning [`HandlerOutcome::RetryMeLater`].
#[derive(Debug, thiserror::Error)]
#[error("retry me later: {}", .0.message)]
pub struct RetryMeLaterError(pub RetryMeLater);

/// Engine-side context passed to a handler invocation.
///
/// Wraps the savepoint connection so handler database work rolls back as a
/// unit on error, and carries the running goal for deadline inheritance.
pub struct HandlerContext<'a> {
    goal: &'a Goal,
    conn: &'a mut PgConnection,
    settings: &'a EngineSettings,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        goal: &'a Goal,
        conn: &'a mut PgConnection,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            goal,
            conn,
            settings,
        }
    }

    /// The goal being pursued.
    pub fn goal(&self) -> &Goal {
        self.goal
    }

    /// Positional arguments from the goal's instructions.
    pub fn args(&self) -> &[serde_json::Value] {
        self.goal
            .instructions
            .as_ref()
            .and_then(|i| i.get("args"))
            .and_then(|a| a.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Keyword arguments from the goal's instructions.
    pub fn kwargs(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.goal
            .instructions
            .as_ref()
            .and_then(|i| i.get("kwargs"))
            .and_then(|k| k.as_object())
    }

    /// Database access within the handler's savepoint.
    pub fn conn(&mut self) -> &mut PgConnection {
        self.conn
    }

    /// Schedule a child goal from inside the handler.
    ///
    /// Runs in the same savepoint, and the child inherits the running
    /// goal's deadline unless the spec names its own.
    pub async fn schedule(&mut self, spec: ScheduleSpec<'_>) -> Result<Goal> {
        scheduler::schedule_on(self.conn, self.settings, spec, Some(self.goal.deadline)).await
    }
}

/// A named unit of user code that pursues goals.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn pursue(&self, ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome>;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Handler").finish()
    }
}

/// A collection of registered [`Handler`] implementations, keyed by the
/// name stored on the goal row. Populated once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name.
    ///
    /// If a handler with the same name is already registered, it is
    /// replaced and the old one is returned.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(name.into(), Arc::new(handler))
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Look up a handler by name, failing with context when absent.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.get(name)
            .with_context(|| format!("no handler registered under {name:?}"))
    }

    /// List the names of all registered handlers.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandler;

    #[async_trait]
    impl Handler for FakeHandler {
        async fn pursue(&self, _ctx: &mut HandlerContext<'_>) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::AllDone)
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        let old = registry.register("noop", FakeHandler);
        assert!(old.is_none());
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", FakeHandler);
        let old = registry.register("noop", FakeHandler);
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_missing_names_the_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("merge-sort").unwrap_err();
        assert!(err.to_string().contains("merge-sort"));
    }

    #[test]
    fn retry_me_later_builder() {
        let r = RetryMeLater::new().message("halfway");
        assert_eq!(r.message, "halfway");
        assert!(r.precondition_date.is_none());
        assert!(r.precondition_goals.is_empty());
    }
}
