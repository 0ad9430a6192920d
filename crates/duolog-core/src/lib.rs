//! # duolog-core
//!
//! Matching engine, session lifecycle and monetization gate for anonymous
//! 1-on-1 chats.
//!
//! - [`directory`]: user profiles, anonymous ids, block lists
//! - [`queue`]: users waiting for a partner, FIFO ordered
//! - [`matcher`]: compatibility rules and first-fit pairing passes
//! - [`session`]: active/ended sessions and their single terminal transition
//! - [`relay`]: forwards messages to the peer as "Partner"
//! - [`gate`]: periodic time-boxed challenge tokens
//! - [`moderation`]: block, report, ban/warn hooks
//! - [`service`]: the [`ChatService`] facade tying it all together
//!
//! State is kept in memory and written through a shared
//! [`duolog_shared::Repository`] before each in-memory commit.

pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod gate;
pub mod locks;
pub mod matcher;
pub mod moderation;
pub mod queue;
pub mod relay;
pub mod service;
pub mod session;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, GateConfig, ModerationConfig};
pub use error::{CoreError, PreconditionError, Result, TokenError};
pub use service::ChatService;
pub use transport::{ChannelTransport, Transport, TransportError};

#[cfg(test)]
mod testing;
