pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod merger;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod schema;
pub mod source;
pub mod stores;
pub mod structure;
pub mod traits;
pub mod worker;

pub use chunking::{count_units, plan_chunks, split_evenly, split_with_overlap, ChunkSpan, ChunkingPolicy};
pub use config::{ConcurrencyConfig, ExtractionCaps, PipelineConfig, ProviderProfile, RetryConfig};
pub use coordinator::{JoinBarrier, SectionCoordinator, SectionJoin, SectionRun};
pub use error::{
    ChunkError, ConfigError, ExtractionFailure, FailureCategory, FailureKind, GraphEditError, IngestError,
    PipelineError, ProviderError, StaleJoin, StoreError, StructureError, ValidationError,
};
pub use lifecycle::{
    recompute_document_status, DocumentTransition, JoinCommit, SectionTransition,
};
pub use merger::{merge_section_graph, rename_node};
pub use models::{
    Chunk, ChunkStatus, Document, DocumentStatus, Entity, ExtractionResult, Graph, GraphEdge, GraphNode,
    ProviderConfig, Relation, ResponseShape, Section, SectionStatus, UsageRecord,
};
pub use pipeline::{DocumentReport, Pipeline};
pub use prompt::{build_extraction_prompt, BookCategory};
pub use providers::{HttpClientFactory, HttpReasoningClient, StaticProviderResolver, StubReasoningClient};
pub use schema::validate_extraction;
pub use source::{
    discover_pdf_files, document_title, load_outline, load_source, LopdfExtractor, OutlineEntry, PageText,
    PdfExtractor, SourceText,
};
pub use stores::{MemoryStore, MemoryUsageLedger};
pub use structure::{recover_structure, RecoveredStructure, SectionRange, StructureOptions, StructureSource};
pub use traits::{ClientFactory, Clock, ProviderResolver, ReasoningClient, StatusStore, SystemClock, UsageLedger};
pub use worker::{ChunkOutcome, ExtractionWorker};
