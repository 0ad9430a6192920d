//! # duolog-shared
//!
//! Types shared by every duolog crate: identifiers, the logical entities
//! (profiles, queue entries, sessions, gate tokens, reports), the outbound
//! payload protocol spoken to the chat transport, and the repository seam
//! used for durable storage.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod repository;
pub mod types;

pub use error::{ParseValueError, RepositoryError};
pub use models::*;
pub use repository::{MemoryRepository, Mutation, Repository};
pub use types::*;
