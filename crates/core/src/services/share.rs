//! Share Tokens (C8): mint/reuse a public token bound to a file set,
//! revoke access, and resolve a token back to its bound files.
//!
//! Opaque, unguessable IDs via [`IdGenerator`] and a lookup-then-validate
//! flow, adapted to a many-to-many binding instead of a single-subject
//! token.

use chrono::Utc;
use nimbus_common::id::IdGenerator;
use nimbus_common::{AppError, AppResult};
use nimbus_db::entities::file;
use nimbus_db::entities::share_link;
use nimbus_db::repositories::file::FileRepository;
use nimbus_db::repositories::share_link::ShareLinkRepository;
use sea_orm::ActiveValue::Set;

/// Minimum token length accepted by [`ShareService::resolve`] before even
/// hitting the database — rejects obviously-malformed input the same way
/// an unknown token would, so the two are indistinguishable to a caller
/// (§4.C8: "never `Expired`, to avoid enumeration").
const MIN_TOKEN_LEN: usize = 8;

/// Public share-link issuance and resolution (§4.C8).
#[derive(Clone)]
pub struct ShareService {
    files: FileRepository,
    share_links: ShareLinkRepository,
    ids: IdGenerator,
}

impl ShareService {
    #[must_use]
    pub fn new(files: FileRepository, share_links: ShareLinkRepository) -> Self {
        Self {
            files,
            share_links,
            ids: IdGenerator::new(),
        }
    }

    /// Reuse `uid`'s existing link if one already covers any of
    /// `file_ids`, extending it with the rest; otherwise mint a fresh
    /// token and link (§4.C8 `mint_or_reuse`).
    pub async fn mint_or_reuse(
        &self,
        user_id: &str,
        file_ids: &[String],
    ) -> AppResult<share_link::Model> {
        let owned = self.files.find_by_ids_owned(file_ids, user_id).await?;
        if owned.len() != file_ids.len() {
            return Err(AppError::NotFound("one or more files".to_string()));
        }

        if let Some(existing) = self.share_links.find_owning_any(user_id, file_ids).await? {
            self.share_links.attach_files(&existing.id, file_ids).await?;
            return Ok(existing);
        }

        let active = share_link::ActiveModel {
            id: Set(self.ids.generate()),
            token: Set(self.ids.generate_token()),
            user_id: Set(user_id.to_string()),
            expires_at: Set(None),
            created_at: Set(Utc::now().into()),
        };

        self.share_links.create_with_files(active, file_ids).await
    }

    /// Detach `file_ids` from `uid`'s share link, if one exists; the link
    /// itself is deleted once its last junction is removed. A no-op if
    /// `uid` has no link covering any of `file_ids` (§4.C8 `revoke`).
    pub async fn revoke(&self, user_id: &str, file_ids: &[String]) -> AppResult<()> {
        let Some(link) = self.share_links.find_owning_any(user_id, file_ids).await? else {
            return Ok(());
        };

        self.share_links.detach_files(&link.id, file_ids).await?;
        Ok(())
    }

    /// Validate `token`, check expiry, and return the files it grants
    /// access to. Expired and unknown tokens are indistinguishable,
    /// both failing `NotFound` (§4.C8).
    pub async fn resolve(&self, token: &str) -> AppResult<Vec<file::Model>> {
        if token.len() < MIN_TOKEN_LEN || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::NotFound("share link".to_string()));
        }

        let link = self
            .share_links
            .find_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound("share link".to_string()))?;

        if link.is_expired(Utc::now().into()) {
            return Err(AppError::NotFound("share link".to_string()));
        }

        let file_ids = self.share_links.attached_file_ids(&link.id).await?;
        self.files.find_by_ids(&file_ids).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase};
    use std::sync::Arc;

    fn repos() -> (FileRepository, ShareLinkRepository) {
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());
        (FileRepository::new(db.clone()), ShareLinkRepository::new(db))
    }

    #[tokio::test]
    async fn resolve_rejects_short_token_without_a_query() {
        let (files, share_links) = repos();
        let service = ShareService::new(files, share_links);
        let result = service.resolve("short").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn resolve_rejects_non_alphanumeric_token() {
        let (files, share_links) = repos();
        let service = ShareService::new(files, share_links);
        let result = service.resolve("abcd-efgh-1234").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
