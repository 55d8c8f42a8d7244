use crate::error::{PipelineError, ProviderError, StoreError};
use crate::lifecycle::{DocumentTransition, JoinCommit, SectionTransition};
use crate::models::{Chunk, Document, Graph, ProviderConfig, Section, SectionStatus, UsageRecord};
use crate::source::SourceText;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Persisted status records. Every status change goes through a compare and
/// set so concurrent writers cannot regress a settled row.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Stores a new document with its text. An id that is already taken is a
    /// `Conflict` and leaves the existing rows untouched.
    async fn insert_document(&self, document: Document, source: Arc<SourceText>) -> Result<(), StoreError>;

    async fn document(&self, document_id: &str) -> Result<Option<Document>, StoreError>;

    /// Applies the transition only when the current status is one of `transition.from`.
    async fn transition_document(
        &self,
        document_id: &str,
        transition: DocumentTransition,
    ) -> Result<Option<Document>, StoreError>;

    async fn touch_document(&self, document_id: &str, seen_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn source(&self, document_id: &str) -> Result<Option<Arc<SourceText>>, StoreError>;

    /// Replaces every section of the document and drops their chunks and graphs.
    async fn replace_sections(&self, document_id: &str, sections: Vec<Section>) -> Result<(), StoreError>;

    /// Sections ordered by index.
    async fn sections(&self, document_id: &str) -> Result<Vec<Section>, StoreError>;

    async fn section(&self, section_id: &str) -> Result<Option<Section>, StoreError>;

    async fn transition_section(
        &self,
        section_id: &str,
        transition: SectionTransition,
    ) -> Result<Option<Section>, StoreError>;

    /// Drops the chunks and graph left by a previous run of the section.
    async fn clear_section_outputs(&self, section_id: &str) -> Result<(), StoreError>;

    async fn replace_chunks(&self, section_id: &str, chunks: Vec<Chunk>) -> Result<(), StoreError>;

    /// Updates one chunk row. Chunks that were replaced by a newer run are ignored.
    async fn put_chunk(&self, chunk: Chunk) -> Result<(), StoreError>;

    async fn chunks(&self, section_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Settles a section and replaces its graph in one step, provided the
    /// section is still `PROCESSING` under `run_id`.
    async fn commit_join(
        &self,
        section_id: &str,
        run_id: Uuid,
        status: SectionStatus,
        graph: Option<Graph>,
    ) -> Result<JoinCommit, StoreError>;

    async fn graph(&self, section_id: &str) -> Result<Option<Graph>, StoreError>;

    async fn put_graph(&self, graph: Graph) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// The chunk text the prompt was built from.
    pub source_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

pub trait ClientFactory: Send + Sync {
    fn client(&self, config: &ProviderConfig) -> Result<Arc<dyn ReasoningClient>, ProviderError>;
}

/// Looks up endpoint, model and credential for a provider name.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ProviderConfig, PipelineError>;
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
