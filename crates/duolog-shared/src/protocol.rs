//! Payloads exchanged with the chat transport.
//!
//! Inbound [`Content`] is what a user sends; [`Outbound`] is everything the
//! core asks the transport to deliver. No outbound variant has a field for a
//! platform id or an anonymous id of another user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::PARTNER_LABEL;
use crate::types::{ContentKind, EndReason, TokenId};

/// A message as received from the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    pub kind: ContentKind,
    /// Message text, or the caption of a file.
    #[serde(default)]
    pub text: Option<String>,
    /// Opaque platform reference to the uploaded file.
    #[serde(default)]
    pub file_ref: Option<String>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            file_ref: None,
        }
    }

    pub fn file(kind: ContentKind, file_ref: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            kind,
            text: caption,
            file_ref: Some(file_ref.into()),
        }
    }
}

/// Payloads addressed to a single user by platform identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// The user entered the waiting queue.
    Searching,

    /// A partner was found and the chat is open.
    PartnerFound,

    /// A relayed message. `from` is always [`PARTNER_LABEL`].
    PartnerMessage {
        from: String,
        kind: ContentKind,
        text: Option<String>,
        file_ref: Option<String>,
    },

    /// Acknowledges to the sender that a file reached the partner.
    Delivered { kind: ContentKind },

    /// The partner skipped, ended, blocked or reported. The concrete reason
    /// is deliberately not disclosed.
    PartnerLeft,

    /// The system closed the chat (timeout, unreachable partner, ban).
    ChatClosed { reason: EndReason },

    /// The gate is due; visit `link`, then redeem `deep_link_payload`.
    Challenge {
        token: TokenId,
        link: String,
        deep_link_payload: String,
        expires_at: DateTime<Utc>,
        unlock_hours: i64,
    },

    /// Challenge completed; features unlocked until `next_due_at`.
    Unlocked { next_due_at: DateTime<Utc> },

    /// A moderator issued a warning, with the reason they gave.
    Warned {
        count: u32,
        threshold: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The account was banned.
    Banned,
}

impl Outbound {
    /// Wrap sender content for delivery to the peer, stripping everything
    /// but the content itself.
    pub fn partner_message(content: Content) -> Self {
        Outbound::PartnerMessage {
            from: PARTNER_LABEL.to_string(),
            kind: content.kind,
            text: content.text,
            file_ref: content.file_ref,
        }
    }
}
