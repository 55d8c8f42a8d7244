use crate::chunking::ChunkingPolicy;
use crate::config::ExtractionCaps;
use crate::error::ExtractionFailure;
use crate::prompt::BookCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Done,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectionStatus {
    Pending,
    Processing,
    Done,
    Failed,
    SkippedTooLarge,
    Timeout,
    Paused,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub title: String,
    pub checksum: String,
    pub total_length: usize,
    pub category: BookCategory,
    pub status: DocumentStatus,
    pub failure_reason: Option<String>,
    /// Provider chosen by the last processing request. Persisted so a restart
    /// does not lose the selection.
    pub provider: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// `{type code}{size bucket}-{hour stamp}-{random}-{digit check}-{letter check}`,
    /// e.g. `K2-1E8D3C-042-7-Q`.
    pub fn generate_id(category: BookCategory, units: usize, now: DateTime<Utc>) -> String {
        let bucket = match units {
            0..=10_000 => 1,
            10_001..=100_000 => 2,
            100_001..=500_000 => 3,
            500_001..=1_000_000 => 4,
            1_000_001..=5_000_000 => 5,
            _ => 6,
        };
        let stamp: u32 = now.format("%y%m%d%H").to_string().parse().unwrap_or_default();
        let hour_code = format!("{stamp:06X}");
        let hour_code = &hour_code[hour_code.len().saturating_sub(6)..];
        let random = (Uuid::new_v4().as_u128() % 1_000) as u32;

        let base = format!("{}{bucket}{hour_code}{random:03}", category.code());
        let sum: u32 = base.chars().map(u32::from).sum();
        let letter = char::from(b'A' + (sum % 26) as u8);
        format!("{}{bucket}-{hour_code}-{random:03}-{}-{letter}", category.code(), sum % 10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub section_id: String,
    pub document_id: String,
    pub index: usize,
    pub title: String,
    pub level: u8,
    pub start_char: usize,
    pub end_char: usize,
    pub status: SectionStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
}

impl Section {
    pub fn id_for(document_id: &str, index: usize) -> String {
        format!("{document_id}:c{index:02}")
    }

    pub fn len(&self) -> usize {
        self.end_char.saturating_sub(self.start_char)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub section_id: String,
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub status: ChunkStatus,
    pub text: String,
    pub result: Option<ExtractionResult>,
    pub error: Option<ExtractionFailure>,
}

impl Chunk {
    pub fn id_for(section_id: &str, index: usize) -> String {
        let code = section_id.rsplit(':').next().unwrap_or(section_id);
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{code}_k{index:03}_{}", &suffix[..6])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The validated shape every provider integration must produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl ExtractionResult {
    pub fn truncate(&mut self, caps: &ExtractionCaps) {
        self.entities.truncate(caps.max_entities);
        self.relations.truncate(caps.max_relations);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

/// Edges point at node names, not node ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relation: String,
    pub evidence: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Graph {
    pub section_id: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn empty(section_id: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn dangling_edges(&self) -> Vec<&GraphEdge> {
        self.edges
            .iter()
            .filter(|edge| self.node(&edge.source).is_none() || self.node(&edge.target).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseShape {
    OpenaiChat,
    Gemini,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: Url,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub model: String,
    pub shape: ResponseShape,
    pub chunking: ChunkingPolicy,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("shape", &self.shape)
            .field("chunking", &self.chunking)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub document_id: String,
    pub chunk_id: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}
