//! Multi-tenant orchestrator for long-running automated client sessions.
//!
//! Each tenant gets an isolated runtime slot; each session owns one remote
//! client driver that is authenticated, kept alive, refreshed under memory
//! pressure and torn down through the [`orchestrator::SessionOrchestrator`].

pub mod agent;
pub mod auth;
pub mod container;
pub mod db;
pub mod driver;
pub mod health;
pub mod isolation;
pub mod orchestrator;
pub mod registry;
pub mod retry;
