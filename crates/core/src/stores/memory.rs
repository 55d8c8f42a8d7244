use crate::error::{StaleJoin, StoreError};
use crate::lifecycle::{DocumentTransition, JoinCommit, SectionTransition};
use crate::models::{Chunk, Document, Graph, Section, SectionStatus, UsageRecord};
use crate::source::SourceText;
use crate::traits::{StatusStore, UsageLedger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    sources: HashMap<String, Arc<SourceText>>,
    sections: HashMap<String, Section>,
    section_ids: HashMap<String, Vec<String>>,
    chunks: HashMap<String, Vec<Chunk>>,
    graphs: HashMap<String, Graph>,
}

impl State {
    fn document_mut(&mut self, document_id: &str) -> Result<&mut Document, StoreError> {
        self.documents.get_mut(document_id).ok_or_else(|| StoreError::NotFound {
            kind: "document",
            id: document_id.to_string(),
        })
    }

    fn section_mut(&mut self, section_id: &str) -> Result<&mut Section, StoreError> {
        self.sections.get_mut(section_id).ok_or_else(|| StoreError::NotFound {
            kind: "section",
            id: section_id.to_string(),
        })
    }
}

/// Process local `StatusStore`. Every operation runs under one lock, so each
/// compare and set is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn insert_document(&self, document: Document, source: Arc<SourceText>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.documents.contains_key(&document.document_id) {
            return Err(StoreError::Conflict {
                kind: "document",
                id: document.document_id,
            });
        }
        state.sources.insert(document.document_id.clone(), source);
        state.documents.insert(document.document_id.clone(), document);
        Ok(())
    }

    async fn document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.state.read().await.documents.get(document_id).cloned())
    }

    async fn transition_document(
        &self,
        document_id: &str,
        transition: DocumentTransition,
    ) -> Result<Option<Document>, StoreError> {
        let mut state = self.state.write().await;
        let document = state.document_mut(document_id)?;
        if !transition.from.contains(&document.status) {
            return Ok(None);
        }
        document.status = transition.to;
        document.failure_reason = transition.failure_reason;
        if let Some(provider) = transition.provider {
            document.provider = Some(provider);
        }
        if let Some(title) = transition.title {
            document.title = title;
        }
        Ok(Some(document.clone()))
    }

    async fn touch_document(&self, document_id: &str, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.document_mut(document_id)?.last_seen_at = Some(seen_at);
        Ok(())
    }

    async fn source(&self, document_id: &str) -> Result<Option<Arc<SourceText>>, StoreError> {
        Ok(self.state.read().await.sources.get(document_id).cloned())
    }

    async fn replace_sections(&self, document_id: &str, sections: Vec<Section>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for old_id in state.section_ids.remove(document_id).unwrap_or_default() {
            state.sections.remove(&old_id);
            state.chunks.remove(&old_id);
            state.graphs.remove(&old_id);
        }

        let ids = sections.iter().map(|section| section.section_id.clone()).collect();
        for section in sections {
            state.sections.insert(section.section_id.clone(), section);
        }
        state.section_ids.insert(document_id.to_string(), ids);
        Ok(())
    }

    async fn sections(&self, document_id: &str) -> Result<Vec<Section>, StoreError> {
        let state = self.state.read().await;
        let mut sections = state
            .section_ids
            .get(document_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.sections.get(id).cloned())
            .collect::<Vec<_>>();
        sections.sort_by_key(|section| section.index);
        Ok(sections)
    }

    async fn section(&self, section_id: &str) -> Result<Option<Section>, StoreError> {
        Ok(self.state.read().await.sections.get(section_id).cloned())
    }

    async fn transition_section(
        &self,
        section_id: &str,
        transition: SectionTransition,
    ) -> Result<Option<Section>, StoreError> {
        let mut state = self.state.write().await;
        let section = state.section_mut(section_id)?;
        if !transition.from.contains(&section.status) {
            return Ok(None);
        }
        section.status = transition.to;
        section.processing_started_at = transition.started_at;
        section.run_id = transition.run_id;
        Ok(Some(section.clone()))
    }

    async fn clear_section_outputs(&self, section_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.chunks.remove(section_id);
        state.graphs.remove(section_id);
        Ok(())
    }

    async fn replace_chunks(&self, section_id: &str, chunks: Vec<Chunk>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.chunks.insert(section_id.to_string(), chunks);
        Ok(())
    }

    async fn put_chunk(&self, chunk: Chunk) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let (section_id, chunk_id) = (chunk.section_id.clone(), chunk.chunk_id.clone());
        if let Some(slot) = state
            .chunks
            .get_mut(&section_id)
            .and_then(|chunks| chunks.iter_mut().find(|existing| existing.chunk_id == chunk_id))
        {
            *slot = chunk;
        }
        Ok(())
    }

    async fn chunks(&self, section_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let state = self.state.read().await;
        let mut chunks = state.chunks.get(section_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    async fn commit_join(
        &self,
        section_id: &str,
        run_id: Uuid,
        status: SectionStatus,
        graph: Option<Graph>,
    ) -> Result<JoinCommit, StoreError> {
        let mut state = self.state.write().await;
        let section = state.section_mut(section_id)?;
        if section.status != SectionStatus::Processing || section.run_id != Some(run_id) {
            return Ok(JoinCommit::Stale(StaleJoin {
                section_id: section_id.to_string(),
                current: section.status,
            }));
        }

        section.status = status;
        section.run_id = None;
        let committed = section.clone();
        match graph {
            Some(graph) => state.graphs.insert(section_id.to_string(), graph),
            None => state.graphs.remove(section_id),
        };
        Ok(JoinCommit::Committed(committed))
    }

    async fn graph(&self, section_id: &str) -> Result<Option<Graph>, StoreError> {
        Ok(self.state.read().await.graphs.get(section_id).cloned())
    }

    async fn put_graph(&self, graph: Graph) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.sections.contains_key(&graph.section_id) {
            return Err(StoreError::NotFound {
                kind: "section",
                id: graph.section_id,
            });
        }
        state.graphs.insert(graph.section_id.clone(), graph);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageLedger {
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }

    /// `(calls, tokens_in, tokens_out)` per provider and model.
    pub async fn totals(&self) -> HashMap<(String, String), (usize, u64, u64)> {
        let mut totals: HashMap<(String, String), (usize, u64, u64)> = HashMap::new();
        for record in self.records.read().await.iter() {
            let entry = totals
                .entry((record.provider.clone(), record.model.clone()))
                .or_default();
            entry.0 += 1;
            entry.1 += record.tokens_in;
            entry.2 += record.tokens_out;
        }
        totals
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record);
        Ok(())
    }
}
