//! # duolog-store
//!
//! Durable storage for duolog, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed upsert/load helpers per entity, and
//! [`SqliteRepository`], which implements the shared `Repository` trait by
//! running each mutation batch inside one SQLite transaction.

pub mod database;
pub mod migrations;
pub mod reports;
pub mod repository;
pub mod sessions;
pub mod tokens;
pub mod users;

mod codec;
mod error;

pub use database::Database;
pub use error::StoreError;
pub use repository::SqliteRepository;
