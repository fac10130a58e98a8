//! Session registry.
//!
//! The single source of truth for session metadata. Other components read
//! snapshots and mutate through the registry's per-session atomic operations.

mod error;
mod models;
mod repository;
mod service;

pub use error::{RegistryError, RegistryResult};
pub use models::{
    CreateSessionOptions, RemovalReason, SessionEvent, SessionMetadata, SessionStatus,
};
pub use repository::SessionRepository;
pub use service::SessionRegistry;
