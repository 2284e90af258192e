//! Persistence layer for the goalpost scheduler: connection pool,
//! migrations, row models, and query functions for the four engine tables
//! (`goals`, `goal_dependencies`, `goal_progress`, `goal_pickups`).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
