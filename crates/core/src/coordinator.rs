use crate::config::ExtractionCaps;
use crate::error::{ExtractionFailure, FailureCategory, FailureKind, StaleJoin, StoreError};
use crate::lifecycle::JoinCommit;
use crate::merger::merge_section_graph;
use crate::models::{Chunk, ChunkStatus, Graph, Section, SectionStatus};
use crate::traits::StatusStore;
use crate::worker::{ChunkOutcome, ExtractionWorker};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One dispatch of a section: the run it belongs to and its planned chunks.
#[derive(Debug, Clone)]
pub struct SectionRun {
    pub section_id: String,
    pub run_id: Uuid,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SectionJoin {
    Committed { section: Section, graph: Graph },
    /// The section was settled elsewhere before the join. Nothing was written.
    Stale(StaleJoin),
}

/// Counting barrier over `expected` chunk outcomes. Hands out the full set,
/// ordered by chunk index, exactly once.
#[derive(Debug)]
pub struct JoinBarrier {
    slots: Vec<Option<ChunkOutcome>>,
    received: usize,
    fired: bool,
}

impl JoinBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            slots: (0..expected).map(|_| None).collect(),
            received: 0,
            fired: false,
        }
    }

    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }

    /// Duplicate and out of range indices are ignored.
    pub fn push(&mut self, index: usize, outcome: ChunkOutcome) -> Option<Vec<ChunkOutcome>> {
        if let Some(slot) = self.slots.get_mut(index).filter(|slot| slot.is_none()) {
            *slot = Some(outcome);
            self.received += 1;
        }
        self.take_if_complete()
    }

    pub fn take_if_complete(&mut self) -> Option<Vec<ChunkOutcome>> {
        if self.fired || self.received < self.slots.len() {
            return None;
        }
        self.fired = true;
        Some(self.slots.iter_mut().filter_map(Option::take).collect())
    }

    /// Fills every empty slot and fires, for workers that never reported back.
    fn fill_missing(&mut self, mut fill: impl FnMut(usize) -> ChunkOutcome) -> Option<Vec<ChunkOutcome>> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fill(index));
                self.received += 1;
            }
        }
        self.take_if_complete()
    }
}

/// Runs every chunk of a section concurrently and merges once all are back.
pub struct SectionCoordinator {
    store: Arc<dyn StatusStore>,
    worker: Arc<ExtractionWorker>,
    call_permits: Arc<Semaphore>,
    caps: ExtractionCaps,
}

impl SectionCoordinator {
    pub fn new(
        store: Arc<dyn StatusStore>,
        worker: Arc<ExtractionWorker>,
        call_permits: Arc<Semaphore>,
        caps: ExtractionCaps,
    ) -> Self {
        Self {
            store,
            worker,
            call_permits,
            caps,
        }
    }

    pub async fn run(&self, run: SectionRun) -> Result<SectionJoin, StoreError> {
        let mut barrier = JoinBarrier::new(run.chunks.len());
        let mut outcomes = barrier.take_if_complete();

        let mut tasks = JoinSet::new();
        for chunk in run.chunks.iter().cloned() {
            let store = Arc::clone(&self.store);
            let worker = Arc::clone(&self.worker);
            let permits = Arc::clone(&self.call_permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let index = chunk.index;
                let outcome = run_chunk(store.as_ref(), &worker, chunk).await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(ready) = barrier.push(index, outcome) {
                        outcomes = Some(ready);
                    }
                }
                Err(error) => warn!(section_id = %run.section_id, error = %error, "chunk task aborted"),
            }
        }

        let outcomes = match outcomes {
            Some(outcomes) => outcomes,
            None => self.fail_missing(&run, &mut barrier).await,
        };

        let status = if outcomes.iter().all(Result::is_ok) {
            SectionStatus::Done
        } else {
            SectionStatus::Failed
        };
        let results = outcomes.into_iter().filter_map(Result::ok).collect::<Vec<_>>();
        let graph = merge_section_graph(&run.section_id, &results, &self.caps);

        match self
            .store
            .commit_join(&run.section_id, run.run_id, status, Some(graph.clone()))
            .await?
        {
            JoinCommit::Committed(section) => {
                info!(
                    section_id = %run.section_id,
                    status = ?section.status,
                    chunks = barrier.expected(),
                    nodes = graph.nodes.len(),
                    edges = graph.edges.len(),
                    "section joined"
                );
                Ok(SectionJoin::Committed { section, graph })
            }
            JoinCommit::Stale(stale) => {
                debug!(section_id = %run.section_id, current = ?stale.current, "discarding stale join");
                Ok(SectionJoin::Stale(stale))
            }
        }
    }

    async fn fail_missing(&self, run: &SectionRun, barrier: &mut JoinBarrier) -> Vec<ChunkOutcome> {
        let mut missing = Vec::new();
        let outcomes = barrier
            .fill_missing(|index| {
                missing.push(index);
                Err(ExtractionFailure {
                    kind: FailureKind::Provider,
                    category: FailureCategory::ServiceError,
                    detail: "worker task ended without a result".to_string(),
                    attempts: 0,
                })
            })
            .unwrap_or_default();

        for chunk in run.chunks.iter().filter(|chunk| missing.contains(&chunk.index)) {
            let mut failed = chunk.clone();
            failed.status = ChunkStatus::Failed;
            failed.error = outcomes.get(chunk.index).and_then(|outcome| outcome.clone().err());
            if let Err(error) = self.store.put_chunk(failed).await {
                warn!(chunk_id = %chunk.chunk_id, error = %error, "failed to record chunk failure");
            }
        }
        outcomes
    }
}

/// A worker owns its chunk row for the whole call.
async fn run_chunk(store: &dyn StatusStore, worker: &ExtractionWorker, mut chunk: Chunk) -> ChunkOutcome {
    chunk.status = ChunkStatus::Processing;
    if let Err(error) = store.put_chunk(chunk.clone()).await {
        warn!(chunk_id = %chunk.chunk_id, error = %error, "failed to mark chunk processing");
    }

    let outcome = worker.extract(&chunk.chunk_id, &chunk.text).await;
    match &outcome {
        Ok(result) => {
            chunk.status = ChunkStatus::Done;
            chunk.result = Some(result.clone());
        }
        Err(failure) => {
            chunk.status = ChunkStatus::Failed;
            chunk.error = Some(failure.clone());
        }
    }
    if let Err(error) = store.put_chunk(chunk.clone()).await {
        warn!(chunk_id = %chunk.chunk_id, error = %error, "failed to record chunk outcome");
    }
    outcome
}
