//! Session linker: one-shot binding of a remote identity to a local
//! account
//!
//! Runs when a local account first materializes: right after the account
//! is saved (registration completing), or right after a successful local
//! login for a session that still has a pending remote identity. A link,
//! once made, is never rewritten; the conflicting case surfaces a
//! warning rather than overwriting either side.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::accounts::LocalAccountStore;
use crate::error::SsoError;
use crate::session::SessionContext;
use crate::xref::IdentityLinkRepository;

/// User-visible notice emitted by a linking attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Notice severity
    pub level: NoticeLevel,
    /// Message for the host to display
    pub message: String,
}

/// Severity of a linker notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    /// Informational notice
    Info,
    /// Warning notice
    Warning,
}

/// Outcome of one linking attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Nothing pending for this session, or the session already records
    /// a link
    NoOp,
    /// The cross-reference already binds this account to the pending
    /// identity; the session record was refreshed
    AlreadyLinked,
    /// The account is linked to a different remote identity; the pending
    /// identity was cleared and a warning raised
    Refused(Notice),
    /// Another request set the link first; left untouched
    LinkedByRace,
    /// The binding was persisted by this call
    Linked(Notice),
}

/// Binds the session's pending remote identity to a local account
pub struct SessionLinker {
    session: SessionContext,
    identity_links: Arc<dyn IdentityLinkRepository>,
    accounts: Arc<dyn LocalAccountStore>,
}

impl SessionLinker {
    /// Create a linker over the session and stores
    #[must_use]
    pub fn new(
        session: SessionContext,
        identity_links: Arc<dyn IdentityLinkRepository>,
        accounts: Arc<dyn LocalAccountStore>,
    ) -> Self {
        Self {
            session,
            identity_links,
            accounts,
        }
    }

    /// Link the pending remote identity to `local_account_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SsoError::RemoteIdentityUnknown`] when no
    /// cross-reference row exists for the pending identity (it must have
    /// been created by the auth exchange before this runs), or a
    /// database error.
    pub async fn link_remote_user_to_local(
        &self,
        local_account_id: i64,
    ) -> Result<LinkOutcome, SsoError> {
        let Some(remote_id) = self.session.remote_id_pending() else {
            return Ok(LinkOutcome::NoOp);
        };
        if self.session.linked_account_id().is_some() {
            return Ok(LinkOutcome::NoOp);
        }

        if let Some(existing) = self
            .identity_links
            .find_by_local_account_id(local_account_id)
            .await?
        {
            if existing.remote_id == remote_id {
                self.session.set_linked_account_id(local_account_id)?;
                return Ok(LinkOutcome::AlreadyLinked);
            }

            // The account already belongs to another remote identity;
            // never overwrite.
            self.session.clear_remote_id_pending();
            tracing::warn!(
                local_account_id,
                "refusing to relink account bound to a different remote identity"
            );
            return Ok(LinkOutcome::Refused(Notice {
                level: NoticeLevel::Warning,
                message: SsoError::AccountAlreadyLinkedElsewhere.to_string(),
            }));
        }

        let Some(link) = self.identity_links.find_by_remote_id(&remote_id).await? else {
            return Err(SsoError::RemoteIdentityUnknown);
        };

        if link.local_account_id.is_some() {
            return Ok(LinkOutcome::LinkedByRace);
        }

        let assigned = self
            .identity_links
            .update_local_account_id(&remote_id, local_account_id)
            .await?;
        if !assigned {
            return Ok(LinkOutcome::LinkedByRace);
        }

        self.session.set_linked_account_id(local_account_id)?;
        tracing::info!(local_account_id, remote_id = %remote_id, "remote identity linked");
        Ok(LinkOutcome::Linked(Notice {
            level: NoticeLevel::Info,
            message: "Account linked".to_string(),
        }))
    }

    /// Trigger: a local account was just saved for the first time
    /// (registration completing).
    ///
    /// # Errors
    ///
    /// Propagates [`Self::link_remote_user_to_local`] errors.
    pub async fn on_account_saved(&self, local_account_id: i64) -> Result<LinkOutcome, SsoError> {
        self.link_remote_user_to_local(local_account_id).await
    }

    /// Trigger: a local login just completed for `username`.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::link_remote_user_to_local`] errors.
    pub async fn on_login_completed(&self, username: &str) -> Result<LinkOutcome, SsoError> {
        if self.session.remote_id_pending().is_none()
            || self.session.linked_account_id().is_some()
        {
            return Ok(LinkOutcome::NoOp);
        }

        let Some(account_id) = self.accounts.id_for_username(username).await? else {
            return Ok(LinkOutcome::NoOp);
        };

        self.link_remote_user_to_local(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::LocalAccount;
    use crate::testing::{
        MemoryIdentityLinkRepository, MemoryLocalAccountStore, MemorySessionStore,
    };

    struct Fixture {
        session: SessionContext,
        links: Arc<MemoryIdentityLinkRepository>,
        linker: SessionLinker,
    }

    fn fixture() -> Fixture {
        let session = SessionContext::new(Arc::new(MemorySessionStore::default()));
        let links = Arc::new(MemoryIdentityLinkRepository::default());
        let accounts = Arc::new(MemoryLocalAccountStore::default());
        accounts.add(LocalAccount {
            id: 42,
            username: "jo".to_string(),
            language: None,
        });
        let linker = SessionLinker::new(
            session.clone(),
            Arc::clone(&links) as Arc<dyn IdentityLinkRepository>,
            accounts,
        );
        Fixture {
            session,
            links,
            linker,
        }
    }

    #[tokio::test]
    async fn test_no_pending_identity_is_a_noop() {
        let f = fixture();
        let outcome = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert_eq!(outcome, LinkOutcome::NoOp);
        assert_eq!(f.links.row_count(), 0);
    }

    #[tokio::test]
    async fn test_links_pending_identity_and_records_session() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked(_)));

        let row = f.links.find_by_remote_id("ext-1").await.unwrap().unwrap();
        assert_eq!(row.local_account_id, Some(42));
        assert_eq!(f.session.linked_account_id(), Some(42));
    }

    #[tokio::test]
    async fn test_linking_without_xref_row_is_fatal() {
        let f = fixture();
        f.session.set_remote_id_pending("ext-unknown").unwrap();

        let err = f.linker.link_remote_user_to_local(42).await.unwrap_err();
        assert!(matches!(err, SsoError::RemoteIdentityUnknown));
    }

    #[tokio::test]
    async fn test_account_linked_to_other_identity_is_refused() {
        let f = fixture();
        // account 42 already belongs to ext-other
        f.links.insert("ext-other").await.unwrap();
        f.links.update_local_account_id("ext-other", 42).await.unwrap();

        f.links.insert("ext-1").await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.link_remote_user_to_local(42).await.unwrap();
        let LinkOutcome::Refused(notice) = outcome else {
            panic!("expected refusal, got {outcome:?}");
        };
        assert_eq!(notice.level, NoticeLevel::Warning);

        // original link untouched, pending identity cleared
        let other = f.links.find_by_remote_id("ext-other").await.unwrap().unwrap();
        assert_eq!(other.local_account_id, Some(42));
        assert!(f.session.remote_id_pending().is_none());
    }

    #[tokio::test]
    async fn test_matching_existing_link_is_fast_path() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        f.links.update_local_account_id("ext-1", 42).await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert_eq!(outcome, LinkOutcome::AlreadyLinked);
        assert_eq!(f.session.linked_account_id(), Some(42));
    }

    #[tokio::test]
    async fn test_second_call_after_success_is_a_noop() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let first = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert!(matches!(first, LinkOutcome::Linked(_)));

        // session records the link, so the second call never re-writes
        let second = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert_eq!(second, LinkOutcome::NoOp);
    }

    #[tokio::test]
    async fn test_race_where_row_got_linked_first_is_left_untouched() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        // another request for a different local account won the race
        f.links.update_local_account_id("ext-1", 99).await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.link_remote_user_to_local(42).await.unwrap();
        assert_eq!(outcome, LinkOutcome::LinkedByRace);

        let row = f.links.find_by_remote_id("ext-1").await.unwrap().unwrap();
        assert_eq!(row.local_account_id, Some(99));
    }

    #[tokio::test]
    async fn test_login_trigger_resolves_username() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.on_login_completed("jo").await.unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked(_)));
        assert_eq!(f.session.linked_account_id(), Some(42));
    }

    #[tokio::test]
    async fn test_login_trigger_unknown_username_is_a_noop() {
        let f = fixture();
        f.links.insert("ext-1").await.unwrap();
        f.session.set_remote_id_pending("ext-1").unwrap();

        let outcome = f.linker.on_login_completed("stranger").await.unwrap();
        assert_eq!(outcome, LinkOutcome::NoOp);
    }
}
