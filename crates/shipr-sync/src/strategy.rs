//! The two ways a [`Collector`] walks a remote: cursor-driven bulk pages, or
//! per-item listings with detail fetches where a listing lacks data.

use shipr_core::error::ShiprError;
use shipr_core::models::activity::PullRequestId;
use shipr_db::ops;
use shipr_host::{CommitPayload, PullRequestPayload, ReviewPayload};

use crate::collector::Collector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Bulk,
    PerItem,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Bulk => write!(f, "bulk"),
            Strategy::PerItem => write!(f, "per-item"),
        }
    }
}

/// Item-level failures cost the item; rate limits stop the whole phase.
fn skip_item(collector: &Collector, what: &str, error: ShiprError) -> Result<(), ShiprError> {
    if error.is_rate_limited() {
        return Err(error);
    }
    tracing::warn!(
        "{}: skipping {what}: {error}",
        collector.repository.full_name
    );
    Ok(())
}

/// Track the cursor between pages. Returns false when paging should stop.
fn advance_cursor(
    collector: &Collector,
    cursor: &mut Option<String>,
    has_next_page: bool,
    end_cursor: Option<String>,
) -> bool {
    if !has_next_page {
        return false;
    }
    match end_cursor {
        Some(next) if cursor.as_deref() != Some(next.as_str()) => {
            *cursor = Some(next);
            true
        }
        _ => {
            tracing::warn!(
                "{}: remote reported more pages without a new cursor, stopping",
                collector.repository.full_name
            );
            false
        }
    }
}

impl Collector {
    pub(crate) async fn bulk_commits(&self) -> Result<(), ShiprError> {
        let since = self.since();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .commit_page(since, cursor.as_deref(), self.page_size)
                .await?;
            for payload in &page.items {
                self.store_commit(payload);
            }
            if !advance_cursor(self, &mut cursor, page.has_next_page, page.end_cursor) {
                return Ok(());
            }
        }
    }

    pub(crate) async fn per_item_commits(&self) -> Result<(), ShiprError> {
        let listed = self
            .source
            .list_commits(self.since(), self.page_size)
            .await?;
        tracing::debug!(
            "{}: {} commits listed",
            self.repository.full_name,
            listed.len()
        );

        for payload in listed {
            let Some(sha) = payload.sha().map(str::to_string) else {
                self.store_commit(&payload);
                continue;
            };
            let repository_id = self.repository.id.clone();
            let known = self
                .store
                .read(|conn| ops::commit_exists(conn, &repository_id, &sha))?;
            if known {
                continue;
            }
            if payload.has_stats() {
                self.store_commit(&payload);
                continue;
            }
            match self.source.get_commit(&sha).await {
                Ok(detail) => self.store_commit(&detail),
                Err(e) => skip_item(self, &format!("commit {sha}"), e)?,
            }
        }
        Ok(())
    }

    pub(crate) async fn bulk_pull_requests(&self) -> Result<(), ShiprError> {
        let since = self.since();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .pull_request_page(since, cursor.as_deref(), self.page_size)
                .await?;
            for payload in &page.items {
                let Some(id) = self.store_pull_request(payload) else {
                    continue;
                };
                for review in payload.embedded_reviews().unwrap_or_default() {
                    self.store_review(&id, &review);
                }
                if payload.has_more_reviews() {
                    self.list_remaining_reviews(&id, payload).await?;
                }
            }
            if !advance_cursor(self, &mut cursor, page.has_next_page, page.end_cursor) {
                return Ok(());
            }
        }
    }

    pub(crate) async fn per_item_pull_requests(&self) -> Result<(), ShiprError> {
        let listed = self
            .source
            .list_pull_requests(self.since(), self.page_size)
            .await?;
        tracing::debug!(
            "{}: {} pull requests listed",
            self.repository.full_name,
            listed.len()
        );

        for payload in listed {
            let Some(id) = self.store_pull_request(&payload) else {
                continue;
            };
            let Some(number) = payload.number() else {
                continue;
            };
            match self.source.list_reviews(number).await {
                Ok(reviews) => {
                    for review in &reviews {
                        self.store_review(&id, review);
                    }
                }
                Err(e) => skip_item(self, &format!("reviews of #{number}"), e)?,
            }
        }
        Ok(())
    }

    /// The embedded review list was cut short; list all reviews of the pull
    /// request. Reviews already stored from the page are not written twice.
    async fn list_remaining_reviews(
        &self,
        id: &PullRequestId,
        payload: &PullRequestPayload,
    ) -> Result<(), ShiprError> {
        let Some(number) = payload.number() else {
            return Ok(());
        };
        tracing::debug!(
            "{}: #{number} has more reviews than were embedded, listing them",
            self.repository.full_name
        );
        match self.source.list_reviews(number).await {
            Ok(reviews) => {
                for review in &reviews {
                    self.store_review(id, review);
                }
                Ok(())
            }
            Err(e) => skip_item(self, &format!("reviews of #{number}"), e),
        }
    }

    fn store_commit(&self, payload: &CommitPayload) {
        let inserted = self.apply_commit(payload);
        self.record(|stats| stats.commit_count += inserted);
    }

    fn store_pull_request(&self, payload: &PullRequestPayload) -> Option<PullRequestId> {
        let (id, written) = self.apply_pull_request(payload)?;
        self.record(|stats| stats.pull_request_count += u32::from(written));
        Some(id)
    }

    fn store_review(&self, pull_request: &PullRequestId, payload: &ReviewPayload) {
        let inserted = self.apply_review(pull_request, payload);
        self.record(|stats| stats.review_count += inserted);
    }
}
