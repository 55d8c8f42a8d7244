use crate::error::StaleJoin;
use crate::models::{DocumentStatus, Section, SectionStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

impl SectionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::SkippedTooLarge | Self::Timeout)
    }

    /// Terminal sections only move again through an explicit re-queue.
    pub fn can_transition_to(&self, next: SectionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing | Self::Paused) => true,
            (Self::Processing, next) => next.is_terminal(),
            (current, Self::Pending) => current.is_terminal(),
            _ => false,
        }
    }
}

impl DocumentStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Paused)
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        match (self, next) {
            (Self::Uploaded, Self::Processing) => true,
            (Self::Processing, next) => next.is_settled(),
            (current, Self::Processing) => current.is_settled(),
            _ => false,
        }
    }
}

/// Compare and set on a document row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTransition {
    pub from: Vec<DocumentStatus>,
    pub to: DocumentStatus,
    pub failure_reason: Option<String>,
    /// Recorded on the document when set.
    pub provider: Option<String>,
    pub title: Option<String>,
}

impl DocumentTransition {
    pub fn start(provider: impl Into<String>) -> Self {
        Self {
            from: vec![
                DocumentStatus::Uploaded,
                DocumentStatus::Done,
                DocumentStatus::Failed,
                DocumentStatus::Paused,
            ],
            to: DocumentStatus::Processing,
            failure_reason: None,
            provider: Some(provider.into()),
            title: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn settle(to: DocumentStatus, failure_reason: Option<String>) -> Self {
        Self {
            from: vec![DocumentStatus::Processing],
            to,
            failure_reason,
            provider: None,
            title: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::settle(DocumentStatus::Failed, Some(reason.into()))
    }
}

/// Compare and set on a section row. `started_at` and `run_id` overwrite the
/// stored values, so any transition away from a run clears them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionTransition {
    pub from: Vec<SectionStatus>,
    pub to: SectionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
}

impl SectionTransition {
    pub fn dispatch(started_at: DateTime<Utc>, run_id: Uuid) -> Self {
        Self {
            from: vec![SectionStatus::Pending],
            to: SectionStatus::Processing,
            started_at: Some(started_at),
            run_id: Some(run_id),
        }
    }

    pub fn pause() -> Self {
        Self::leaving(vec![SectionStatus::Pending, SectionStatus::Processing], SectionStatus::Paused)
    }

    pub fn timeout() -> Self {
        Self::leaving(vec![SectionStatus::Processing], SectionStatus::Timeout)
    }

    /// Re-queues everything except finished sections.
    pub fn requeue() -> Self {
        Self::leaving(
            vec![
                SectionStatus::Processing,
                SectionStatus::Failed,
                SectionStatus::SkippedTooLarge,
                SectionStatus::Timeout,
                SectionStatus::Paused,
            ],
            SectionStatus::Pending,
        )
    }

    fn leaving(from: Vec<SectionStatus>, to: SectionStatus) -> Self {
        Self {
            from,
            to,
            started_at: None,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinCommit {
    Committed(Section),
    Stale(StaleJoin),
}

/// `None` while any section is still pending or processing.
pub fn recompute_document_status(sections: &[Section]) -> Option<DocumentStatus> {
    if sections.is_empty() || sections.iter().any(|section| section.status.is_active()) {
        return None;
    }
    if sections.iter().any(|section| section.status.is_failure()) {
        return Some(DocumentStatus::Failed);
    }
    if sections.iter().any(|section| section.status == SectionStatus::Paused) {
        return Some(DocumentStatus::Paused);
    }
    Some(DocumentStatus::Done)
}

/// A document that never sent a liveness signal is not considered inactive.
pub fn is_inactive(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    last_seen_at.is_some_and(|seen| elapsed(seen, now) > threshold)
}

pub fn timed_out(section: &Section, now: DateTime<Utc>, timeout: Duration) -> bool {
    section.status == SectionStatus::Processing
        && section
            .processing_started_at
            .is_some_and(|started| elapsed(started, now) > timeout)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

pub fn failure_reason(sections: &[Section]) -> Option<String> {
    let failed = sections
        .iter()
        .filter(|section| section.status.is_failure())
        .map(|section| format!("{} ({:?})", section.title, section.status))
        .collect::<Vec<_>>();
    if failed.is_empty() {
        return None;
    }
    Some(format!("{} section(s) did not complete: {}", failed.len(), failed.join(", ")))
}
