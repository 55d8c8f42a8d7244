use crate::chunking::{count_units, plan_chunks};
use crate::config::PipelineConfig;
use crate::coordinator::{SectionCoordinator, SectionRun};
use crate::error::{ChunkError, GraphEditError, PipelineError, Result, StoreError, StructureError};
use crate::lifecycle::{
    failure_reason, is_inactive, recompute_document_status, timed_out, DocumentTransition, SectionTransition,
};
use crate::merger::rename_node;
use crate::models::{Chunk, ChunkStatus, Document, DocumentStatus, Graph, ProviderConfig, Section, SectionStatus};
use crate::prompt::BookCategory;
use crate::source::SourceText;
use crate::structure::recover_structure;
use crate::traits::{ClientFactory, Clock, ProviderResolver, StatusStore, SystemClock, UsageLedger};
use crate::worker::ExtractionWorker;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ID_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub document: Document,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Continue,
    Halt,
}

/// Drives documents from upload to a settled status and serves reads of the
/// results. Provider calls are bounded by one semaphore shared by every
/// document this pipeline processes.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn StatusStore>,
    resolver: Arc<dyn ProviderResolver>,
    clients: Arc<dyn ClientFactory>,
    ledger: Arc<dyn UsageLedger>,
    clock: Arc<dyn Clock>,
    call_permits: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn StatusStore>,
        resolver: Arc<dyn ProviderResolver>,
        clients: Arc<dyn ClientFactory>,
        ledger: Arc<dyn UsageLedger>,
    ) -> Self {
        let call_permits = Arc::new(Semaphore::new(config.concurrency.max_concurrent_calls.max(1)));
        Self {
            config: Arc::new(config),
            store,
            resolver,
            clients,
            ledger,
            clock: Arc::new(SystemClock),
            call_permits,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registers a document in `uploaded` state. Nothing is analysed until a
    /// processing request arrives. A generated id that is already taken is
    /// drawn again, up to `MAX_ID_ATTEMPTS` times.
    pub async fn ingest(&self, title: &str, source: SourceText, category: BookCategory) -> Result<Document> {
        let now = self.clock.now();
        let units = count_units(source.text());
        let checksum = source.checksum();
        let total_length = source.total_chars();
        let source = Arc::new(source);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let document = Document {
                document_id: Document::generate_id(category, units, now),
                title: title.trim().to_string(),
                checksum: checksum.clone(),
                total_length,
                category,
                status: DocumentStatus::Uploaded,
                failure_reason: None,
                provider: None,
                last_seen_at: None,
                created_at: now,
            };

            match self.store.insert_document(document.clone(), Arc::clone(&source)).await {
                Ok(()) => {
                    info!(document_id = %document.document_id, units, category = %category, "document ingested");
                    return Ok(document);
                }
                Err(StoreError::Conflict { id, .. }) if attempt < MAX_ID_ATTEMPTS => {
                    debug!(document_id = %id, attempt, "generated document id is taken, drawing another");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Records a client liveness signal. A paused document stays paused.
    pub async fn liveness(&self, document_id: &str) -> Result<()> {
        self.load_document(document_id).await?;
        self.store.touch_document(document_id, self.clock.now()).await?;
        Ok(())
    }

    /// Starts or resumes processing and returns once every dispatched section
    /// has joined or the run halted at a checkpoint.
    ///
    /// The provider is taken from `provider`, then from the previous request
    /// on this document, then from the configured default.
    pub async fn process_document(&self, document_id: &str, provider: Option<&str>) -> Result<DocumentReport> {
        let document = self.load_document(document_id).await?;
        if !document.status.can_transition_to(DocumentStatus::Processing) {
            return Err(PipelineError::InvalidTransition {
                from: document.status,
                to: DocumentStatus::Processing,
            });
        }

        let provider_name = provider
            .map(str::to_string)
            .or_else(|| document.provider.clone())
            .unwrap_or_else(|| self.config.default_provider.clone());
        let provider = self.resolver.resolve(&provider_name).await?;
        let client = self.clients.client(&provider)?;
        let source = self.store.source(document_id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "source",
            id: document_id.to_string(),
        })?;

        let existing = self.store.sections(document_id).await?;
        let resume = document.status == DocumentStatus::Paused && !existing.is_empty();
        let planned = if resume {
            Ok(None)
        } else {
            self.plan_sections(document_id, &source).map(Some)
        };
        let title = match &planned {
            Ok(Some((title, _))) => title.clone(),
            _ => None,
        };

        self.store.touch_document(document_id, self.clock.now()).await?;
        let started = self
            .store
            .transition_document(document_id, DocumentTransition::start(provider.name.clone()).with_title(title))
            .await?;
        if started.is_none() {
            let current = self.load_document(document_id).await?;
            return Err(PipelineError::InvalidTransition {
                from: current.status,
                to: DocumentStatus::Processing,
            });
        }
        info!(document_id, provider = %provider.name, model = %provider.model, resume, "document processing started");

        match planned {
            Err(error) => {
                warn!(document_id, error = %error, "document failed before dispatch");
                self.store
                    .transition_document(document_id, DocumentTransition::fail(error.to_string()))
                    .await?;
                return Err(error);
            }
            Ok(Some((_, sections))) => self.store.replace_sections(document_id, sections).await?,
            Ok(None) => {
                for section in existing.iter().filter(|section| section.status != SectionStatus::Done) {
                    self.store
                        .transition_section(&section.section_id, SectionTransition::requeue())
                        .await?;
                    self.store.clear_section_outputs(&section.section_id).await?;
                }
            }
        }

        let worker = ExtractionWorker::new(
            document_id,
            client,
            Arc::clone(&self.ledger),
            self.config.retry.clone(),
            self.config.caps,
            document.category,
        );
        let coordinator = SectionCoordinator::new(
            Arc::clone(&self.store),
            Arc::new(worker),
            Arc::clone(&self.call_permits),
            self.config.caps,
        );
        let processor = SectionProcessor {
            document_id: document_id.to_string(),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            source,
            provider: Arc::new(provider),
            coordinator: Arc::new(coordinator),
            clock: Arc::clone(&self.clock),
        };

        self.run_sections(&processor).await?;
        reconcile_document(self.store.as_ref(), document_id).await?;
        self.report(document_id).await
    }

    /// Current document and section statuses. Sections that have been
    /// processing for longer than the section timeout are expired first.
    pub async fn document_status(&self, document_id: &str) -> Result<DocumentReport> {
        self.load_document(document_id).await?;

        let now = self.clock.now();
        let mut expired = false;
        for section in self.store.sections(document_id).await? {
            if !timed_out(&section, now, self.config.section_timeout) {
                continue;
            }
            if self
                .store
                .transition_section(&section.section_id, SectionTransition::timeout())
                .await?
                .is_some()
            {
                warn!(document_id, section_id = %section.section_id, "section timed out");
                expired = true;
            }
        }
        if expired {
            reconcile_document(self.store.as_ref(), document_id).await?;
        }

        self.report(document_id).await
    }

    pub async fn section_text(&self, section_id: &str) -> Result<String> {
        let section = self.load_section(section_id).await?;
        let source = self
            .store
            .source(&section.document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(section.document_id.clone()))?;
        Ok(source.slice(section.start_char, section.end_char).to_string())
    }

    pub async fn section_graph(&self, section_id: &str) -> Result<Option<Graph>> {
        self.load_section(section_id).await?;
        Ok(self.store.graph(section_id).await?)
    }

    pub async fn rename_graph_node(&self, section_id: &str, old_name: &str, new_name: &str) -> Result<Graph> {
        let mut graph = self
            .section_graph(section_id)
            .await?
            .ok_or_else(|| GraphEditError::NodeNotFound(old_name.to_string()))?;
        rename_node(&mut graph, old_name, new_name)?;
        self.store.put_graph(graph.clone()).await?;
        info!(section_id, old_name, new_name, "graph node renamed");
        Ok(graph)
    }

    fn plan_sections(&self, document_id: &str, source: &SourceText) -> Result<(Option<String>, Vec<Section>)> {
        let units = count_units(source.text());
        if units > self.config.max_document_units {
            return Err(PipelineError::SizeLimit {
                units,
                limit: self.config.max_document_units,
            });
        }

        let recovered = recover_structure(source, &self.config.structure)?;
        if recovered.sections.is_empty() {
            return Err(StructureError::NoStructuralSignal.into());
        }
        info!(
            document_id,
            source = ?recovered.source,
            sections = recovered.sections.len(),
            "structure recovered"
        );

        let sections = recovered
            .sections
            .into_iter()
            .enumerate()
            .map(|(index, range)| Section {
                section_id: Section::id_for(document_id, index),
                document_id: document_id.to_string(),
                index,
                title: range.title,
                level: range.level,
                start_char: range.start_char,
                end_char: range.end_char,
                status: SectionStatus::Pending,
                processing_started_at: None,
                run_id: None,
            })
            .collect();
        Ok((recovered.title, sections))
    }

    async fn run_sections(&self, processor: &SectionProcessor) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max_concurrent_sections.max(1)));
        let pending = self
            .store
            .sections(&processor.document_id)
            .await?
            .into_iter()
            .filter(|section| section.status == SectionStatus::Pending);

        let mut tasks = JoinSet::new();
        for section in pending {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            match processor.checkpoint().await {
                Ok(Checkpoint::Continue) => {}
                Ok(Checkpoint::Halt) => break,
                Err(error) => {
                    warn!(document_id = %processor.document_id, error = %error, "dispatch checkpoint failed");
                    break;
                }
            }

            let processor = processor.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let section_id = section.section_id.clone();
                (section_id, processor.run(section).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((section_id, Err(error))) => warn!(section_id = %section_id, error = %error, "section run failed"),
                Err(error) => warn!(document_id = %processor.document_id, error = %error, "section task aborted"),
            }
        }
        Ok(())
    }

    async fn load_document(&self, document_id: &str) -> Result<Document> {
        self.store
            .document(document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))
    }

    async fn load_section(&self, section_id: &str) -> Result<Section> {
        self.store
            .section(section_id)
            .await?
            .ok_or_else(|| PipelineError::SectionNotFound(section_id.to_string()))
    }

    async fn report(&self, document_id: &str) -> Result<DocumentReport> {
        Ok(DocumentReport {
            document: self.load_document(document_id).await?,
            sections: self.store.sections(document_id).await?,
        })
    }
}

/// Everything one section run needs, cloned into each section task.
#[derive(Clone)]
struct SectionProcessor {
    document_id: String,
    store: Arc<dyn StatusStore>,
    config: Arc<PipelineConfig>,
    source: Arc<SourceText>,
    provider: Arc<ProviderConfig>,
    coordinator: Arc<SectionCoordinator>,
    clock: Arc<dyn Clock>,
}

impl SectionProcessor {
    async fn run(&self, section: Section) -> Result<()> {
        let run_id = Uuid::new_v4();
        let Some(section) = self
            .store
            .transition_section(&section.section_id, SectionTransition::dispatch(self.clock.now(), run_id))
            .await?
        else {
            debug!(section_id = %section.section_id, "section is no longer pending");
            return Ok(());
        };
        self.store.clear_section_outputs(&section.section_id).await?;

        let text = self.source.slice(section.start_char, section.end_char);
        let spans = match plan_chunks(text, &self.provider.chunking) {
            Ok(spans) => spans,
            Err(error) => {
                let status = match error {
                    ChunkError::BudgetExceeded { .. } => SectionStatus::SkippedTooLarge,
                    ChunkError::InvalidConfig(_) => SectionStatus::Failed,
                };
                warn!(section_id = %section.section_id, status = ?status, error = %error, "section was not chunked");
                self.store
                    .commit_join(&section.section_id, run_id, status, None)
                    .await?;
                return Ok(());
            }
        };

        let chunks = spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| Chunk {
                chunk_id: Chunk::id_for(&section.section_id, index),
                section_id: section.section_id.clone(),
                index,
                start_char: span.start,
                end_char: span.end,
                status: ChunkStatus::Pending,
                text: span.text,
                result: None,
                error: None,
            })
            .collect::<Vec<_>>();
        self.store.replace_chunks(&section.section_id, chunks.clone()).await?;
        debug!(section_id = %section.section_id, chunks = chunks.len(), "section planned");

        if self.checkpoint().await? == Checkpoint::Halt {
            return Ok(());
        }

        self.coordinator
            .run(SectionRun {
                section_id: section.section_id,
                run_id,
                chunks,
            })
            .await?;
        Ok(())
    }

    /// Runs before every dispatch. An inactive client pauses the document.
    async fn checkpoint(&self) -> Result<Checkpoint> {
        let Some(document) = self.store.document(&self.document_id).await? else {
            return Ok(Checkpoint::Halt);
        };
        if document.status != DocumentStatus::Processing {
            debug!(document_id = %self.document_id, status = ?document.status, "document is not processing, halting dispatch");
            return Ok(Checkpoint::Halt);
        }
        if is_inactive(document.last_seen_at, self.clock.now(), self.config.pause_after_inactive) {
            info!(document_id = %self.document_id, "client inactive, pausing document");
            pause_document(self.store.as_ref(), &self.document_id).await?;
            return Ok(Checkpoint::Halt);
        }
        Ok(Checkpoint::Continue)
    }
}

async fn pause_document(store: &dyn StatusStore, document_id: &str) -> Result<(), StoreError> {
    for section in store.sections(document_id).await? {
        if section.status.is_active() {
            store
                .transition_section(&section.section_id, SectionTransition::pause())
                .await?;
        }
    }
    store
        .transition_document(document_id, DocumentTransition::settle(DocumentStatus::Paused, None))
        .await?;
    Ok(())
}

/// Settles the document once no section is active. A document that was paused
/// or settled elsewhere is left alone.
async fn reconcile_document(store: &dyn StatusStore, document_id: &str) -> Result<Option<DocumentStatus>, StoreError> {
    let sections = store.sections(document_id).await?;
    let Some(status) = recompute_document_status(&sections) else {
        return Ok(None);
    };
    let reason = match status {
        DocumentStatus::Failed => failure_reason(&sections),
        _ => None,
    };
    if let Some(document) = store
        .transition_document(document_id, DocumentTransition::settle(status, reason))
        .await?
    {
        info!(document_id, status = ?document.status, "document settled");
    }
    Ok(Some(status))
}
