//! Message relay.
//!
//! Forwards sender content to the peer attributed only as "Partner". The
//! payload is built from the content alone, so no identity of the sender
//! can reach the peer. A peer whose transport rejects the delivery is
//! treated as disconnected and the session is closed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use duolog_shared::protocol::{Content, Outbound};
use duolog_shared::types::{ContentKind, EndReason, SessionId, UserId};

use crate::directory::UserDirectory;
use crate::error::{CoreError, PreconditionError, Result};
use crate::session::SessionStore;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReceipt {
    pub session_id: SessionId,
    pub message_count: u64,
}

fn validate(content: &Content) -> std::result::Result<(), PreconditionError> {
    let has_text = content.text.as_deref().is_some_and(|t| !t.trim().is_empty());
    let has_file = content.file_ref.as_deref().is_some_and(|f| !f.is_empty());
    match content.kind {
        ContentKind::Text if has_text => Ok(()),
        kind if kind.is_file() && has_file => Ok(()),
        _ => Err(PreconditionError::EmptyContent),
    }
}

pub struct MessageRelay {
    sessions: Arc<SessionStore>,
    directory: Arc<UserDirectory>,
    transport: Arc<dyn Transport>,
}

impl MessageRelay {
    pub fn new(
        sessions: Arc<SessionStore>,
        directory: Arc<UserDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            sessions,
            directory,
            transport,
        }
    }

    pub async fn relay(
        &self,
        from: UserId,
        content: Content,
        now: DateTime<Utc>,
    ) -> Result<RelayReceipt> {
        validate(&content)?;

        let session = self
            .sessions
            .active_for(from)
            .await
            .ok_or(PreconditionError::NoActiveSession)?;
        let peer = session
            .peer_of(from)
            .map(|p| p.user_id)
            .ok_or(PreconditionError::NoActiveSession)?;

        if content.kind.is_file() {
            let accepts_files = self
                .directory
                .get(peer)
                .await
                .is_some_and(|profile| profile.allow_files);
            if !accepts_files {
                return Err(PreconditionError::FilesNotAllowed.into());
            }
        }

        let kind = content.kind;
        if let Err(e) = self
            .transport
            .deliver(peer, Outbound::partner_message(content))
        {
            warn!(session = %session.session_id, error = %e, "Relay failed, closing session");
            let termination = self
                .sessions
                .end(&session.session_id, EndReason::Disconnect, None, now, vec![])
                .await?;
            if termination.is_winner() {
                let _ = self.transport.deliver(
                    from,
                    Outbound::ChatClosed {
                        reason: EndReason::Disconnect,
                    },
                );
            }
            return Err(CoreError::PeerUnreachable);
        }

        // The peer already has the message; a failed counter write is not
        // worth failing the request over.
        let message_count = match self.sessions.record_message(&session.session_id, now).await {
            Ok(Some(count)) => count,
            Ok(None) => session.message_count,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "Failed to record message");
                session.message_count
            }
        };

        if kind.is_file() {
            let _ = self.transport.deliver(from, Outbound::Delivered { kind });
        }

        debug!(session = %session.session_id, kind = %kind, "Relayed message");
        Ok(RelayReceipt {
            session_id: session.session_id,
            message_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::profile;
    use crate::transport::ChannelTransport;
    use duolog_shared::{Gender, MemoryRepository, Preference, Repository};

    struct Fixture {
        sessions: Arc<SessionStore>,
        transport: Arc<ChannelTransport>,
        relay: MessageRelay,
    }

    async fn fixture(b_allows_files: bool) -> Fixture {
        let now = Utc::now();
        let a = profile(1, Gender::Male, Preference::Any, now);
        let mut b = profile(2, Gender::Female, Preference::Any, now);
        b.allow_files = b_allows_files;

        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let directory = Arc::new(UserDirectory::with_users(
            repo.clone(),
            vec![a.clone(), b.clone()],
        ));
        let sessions = Arc::new(SessionStore::new(repo));
        sessions
            .create(a.participant(), b.participant(), now)
            .await
            .unwrap();

        let transport = Arc::new(ChannelTransport::new());
        let relay = MessageRelay::new(sessions.clone(), directory, transport.clone());
        Fixture {
            sessions,
            transport,
            relay,
        }
    }

    #[tokio::test]
    async fn test_message_reaches_peer_as_partner() {
        let f = fixture(true).await;
        let mut rx = f.transport.subscribe(UserId(2));

        let receipt = f
            .relay
            .relay(UserId(1), Content::text("hello"), Utc::now())
            .await
            .unwrap();
        assert_eq!(receipt.message_count, 1);

        let delivered = rx.try_recv().unwrap();
        let json = serde_json::to_string(&delivered).unwrap();
        assert!(json.contains("\"from\":\"Partner\""));
        assert!(!json.contains("u_00000001"));
        assert!(!json.contains("\"1\""));
    }

    #[tokio::test]
    async fn test_files_need_consent() {
        let f = fixture(false).await;
        let mut rx = f.transport.subscribe(UserId(2));

        let err = f
            .relay
            .relay(
                UserId(1),
                Content::file(ContentKind::Photo, "file-1", None),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Precondition(PreconditionError::FilesNotAllowed)
        ));
        assert!(rx.try_recv().is_err());

        // Text still flows, and the session is untouched.
        f.relay
            .relay(UserId(1), Content::text("ok"), Utc::now())
            .await
            .unwrap();
        assert!(f.sessions.is_in_session(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_file_acknowledged_to_sender() {
        let f = fixture(true).await;
        let mut sender_rx = f.transport.subscribe(UserId(1));
        let mut peer_rx = f.transport.subscribe(UserId(2));

        f.relay
            .relay(
                UserId(1),
                Content::file(ContentKind::Voice, "file-9", None),
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(matches!(
            peer_rx.try_recv().unwrap(),
            Outbound::PartnerMessage { kind: ContentKind::Voice, .. }
        ));
        assert_eq!(
            sender_rx.try_recv().unwrap(),
            Outbound::Delivered {
                kind: ContentKind::Voice
            }
        );
    }

    #[tokio::test]
    async fn test_no_session() {
        let f = fixture(true).await;
        let err = f
            .relay
            .relay(UserId(3), Content::text("anyone?"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Precondition(PreconditionError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let f = fixture(true).await;
        let empty = Content {
            kind: ContentKind::Photo,
            text: Some("caption only".into()),
            file_ref: None,
        };
        assert!(matches!(
            f.relay.relay(UserId(1), empty, Utc::now()).await,
            Err(CoreError::Precondition(PreconditionError::EmptyContent))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_closes_session() {
        let f = fixture(true).await;
        let mut sender_rx = f.transport.subscribe(UserId(1));

        let err = f
            .relay
            .relay(UserId(1), Content::text("hello?"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PeerUnreachable));
        assert!(!f.sessions.is_in_session(UserId(1)).await);
        assert!(!f.sessions.is_in_session(UserId(2)).await);
        assert_eq!(
            sender_rx.try_recv().unwrap(),
            Outbound::ChatClosed {
                reason: EndReason::Disconnect
            }
        );
    }
}
