//! HTTP side of the channel transport.
//!
//! Each user's receiving half lives here between polls. A mailbox is opened
//! on the user's first request, so a user is reachable from the moment they
//! start searching, and closed on an explicit disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use duolog_core::ChannelTransport;
use duolog_shared::protocol::Outbound;
use duolog_shared::UserId;

type Inbox = Arc<AsyncMutex<mpsc::Receiver<Outbound>>>;

pub struct Mailboxes {
    transport: Arc<ChannelTransport>,
    open: Mutex<HashMap<UserId, Inbox>>,
}

impl Mailboxes {
    pub fn new(transport: Arc<ChannelTransport>) -> Self {
        Self {
            transport,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The user's inbox, opening one if needed.
    pub fn ensure(&self, user_id: UserId) -> Inbox {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(inbox) = open.get(&user_id) {
            if self.transport.is_connected(user_id) {
                return inbox.clone();
            }
        }
        let inbox = Arc::new(AsyncMutex::new(self.transport.subscribe(user_id)));
        open.insert(user_id, inbox.clone());
        inbox
    }

    /// Drop the inbox; later deliveries to the user fail.
    pub fn close(&self, user_id: UserId) -> bool {
        let removed = self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&user_id)
            .is_some();
        self.transport.unsubscribe(user_id);
        removed
    }

    /// Take up to `max` pending payloads. With nothing pending, waits up to
    /// `wait` for the first one.
    pub async fn poll(&self, user_id: UserId, wait: Duration, max: usize) -> Vec<Outbound> {
        let inbox = self.ensure(user_id);
        let mut rx = inbox.lock().await;

        let mut out = Vec::new();
        drain(&mut rx, &mut out, max);
        if out.is_empty() && !wait.is_zero() {
            if let Ok(Some(first)) = tokio::time::timeout(wait, rx.recv()).await {
                out.push(first);
                drain(&mut rx, &mut out, max);
            }
        }

        debug!(user = %user_id, count = out.len(), "Updates polled");
        out
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

fn drain(rx: &mut mpsc::Receiver<Outbound>, out: &mut Vec<Outbound>, max: usize) {
    while out.len() < max {
        match rx.try_recv() {
            Ok(payload) => out.push(payload),
            Err(_) => break,
        }
    }
}
