//! Outbound delivery seam.
//!
//! The core hands every payload to a [`Transport`] addressed by platform
//! identity, after it has released all of its own locks. [`ChannelTransport`]
//! keeps one bounded mailbox per connected user; whoever owns the receiving
//! half (the HTTP long-poll endpoint, a bot adapter, a test) drains it.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use duolog_shared::constants::MAILBOX_CAPACITY;
use duolog_shared::protocol::Outbound;
use duolog_shared::types::UserId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nobody is listening for this user.
    #[error("User {0} is not connected")]
    Unreachable(UserId),

    /// The user stopped draining their mailbox.
    #[error("Mailbox of user {0} is full")]
    MailboxFull(UserId),
}

pub trait Transport: Send + Sync {
    fn deliver(&self, to: UserId, payload: Outbound) -> Result<(), TransportError>;
}

/// In-process transport backed by one `mpsc` channel per user.
pub struct ChannelTransport {
    senders: RwLock<HashMap<UserId, mpsc::Sender<Outbound>>>,
    capacity: usize,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::with_capacity(MAILBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a mailbox for `user_id`, replacing any previous one. Payloads
    /// still queued in the replaced mailbox are dropped with it.
    pub fn subscribe(&self, user_id: UserId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let replaced = self
            .senders
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id, tx)
            .is_some();
        info!(user = %user_id, replaced, "Mailbox opened");
        rx
    }

    pub fn unsubscribe(&self, user_id: UserId) -> bool {
        let removed = self
            .senders
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&user_id)
            .is_some();
        if removed {
            info!(user = %user_id, "Mailbox closed");
        }
        removed
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.senders
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&user_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn connected_count(&self) -> usize {
        self.senders
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ChannelTransport {
    fn deliver(&self, to: UserId, payload: Outbound) -> Result<(), TransportError> {
        let senders = self.senders.read().unwrap_or_else(|p| p.into_inner());
        let tx = senders.get(&to).ok_or(TransportError::Unreachable(to))?;

        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                debug!(user = %to, "Mailbox full, payload rejected");
                TransportError::MailboxFull(to)
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Unreachable(to),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_to_subscriber() {
        let transport = ChannelTransport::new();
        let mut rx = transport.subscribe(UserId(1));

        transport.deliver(UserId(1), Outbound::PartnerFound).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::PartnerFound);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_user_unreachable() {
        let transport = ChannelTransport::new();
        assert_eq!(
            transport.deliver(UserId(9), Outbound::Searching),
            Err(TransportError::Unreachable(UserId(9)))
        );
    }

    #[test]
    fn test_dropped_receiver_unreachable() {
        let transport = ChannelTransport::new();
        drop(transport.subscribe(UserId(1)));
        assert!(!transport.is_connected(UserId(1)));
        assert_eq!(
            transport.deliver(UserId(1), Outbound::Searching),
            Err(TransportError::Unreachable(UserId(1)))
        );
    }

    #[test]
    fn test_full_mailbox() {
        let transport = ChannelTransport::with_capacity(1);
        let _rx = transport.subscribe(UserId(1));
        transport.deliver(UserId(1), Outbound::Searching).unwrap();
        assert_eq!(
            transport.deliver(UserId(1), Outbound::Searching),
            Err(TransportError::MailboxFull(UserId(1)))
        );
    }

    #[test]
    fn test_unsubscribe() {
        let transport = ChannelTransport::new();
        let _rx = transport.subscribe(UserId(1));
        assert_eq!(transport.connected_count(), 1);
        assert!(transport.unsubscribe(UserId(1)));
        assert!(!transport.unsubscribe(UserId(1)));
        assert_eq!(transport.connected_count(), 0);
    }
}
