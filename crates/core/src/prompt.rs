use crate::config::ExtractionCaps;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SYSTEM_PROMPT: &str = "Return only valid JSON.";

/// Book categories steer the extraction focus. Unknown values fall back to `General`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookCategory {
    Textbook,
    Handbook,
    Humanities,
    Exam,
    PopularScience,
    Business,
    HistoryGeo,
    Literature,
    Lifestyle,
    #[default]
    General,
}

impl BookCategory {
    pub const ALL: [BookCategory; 10] = [
        Self::Textbook,
        Self::Handbook,
        Self::Humanities,
        Self::Exam,
        Self::PopularScience,
        Self::Business,
        Self::HistoryGeo,
        Self::Literature,
        Self::Lifestyle,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Textbook => "textbook",
            Self::Handbook => "handbook",
            Self::Humanities => "humanities",
            Self::Exam => "exam",
            Self::PopularScience => "popular_science",
            Self::Business => "business",
            Self::HistoryGeo => "history_geo",
            Self::Literature => "literature",
            Self::Lifestyle => "lifestyle",
            Self::General => "general",
        }
    }

    /// Accepts current keys, older category names and single letter type codes.
    pub fn normalize(value: Option<&str>) -> Self {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::General;
        };
        let candidate = raw.to_lowercase();

        if let Some(category) = Self::ALL.iter().find(|category| category.as_str() == candidate) {
            return *category;
        }

        match candidate.as_str() {
            "technology" | "education" => Self::Textbook,
            "history" => Self::HistoryGeo,
            "philosophy" | "biography" => Self::Humanities,
            "economics" => Self::Business,
            "art" => Self::Literature,
            "other" => Self::General,
            _ => Self::ALL
                .iter()
                .find(|category| category.code().eq_ignore_ascii_case(&candidate))
                .copied()
                .unwrap_or(Self::General),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Textbook => "B",
            Self::Handbook => "C",
            Self::Humanities => "D",
            Self::Exam => "E",
            Self::PopularScience => "F",
            Self::Business => "G",
            Self::HistoryGeo => "H",
            Self::Literature => "I",
            Self::Lifestyle => "J",
            Self::General => "K",
        }
    }

    fn focus(&self) -> &'static str {
        match self {
            Self::Textbook => "technical concepts, methods, algorithms, components and how they depend on each other",
            Self::Handbook => "procedures, standards, parameters, tools and when each one applies",
            Self::Humanities => "concepts, arguments, schools of thought and the people behind them",
            Self::Exam => "testable knowledge points, definitions, formulas and common pitfalls",
            Self::PopularScience => "phenomena, scientific principles, discoveries and cause and effect",
            Self::Business => "models, metrics, market actors, policy tools and causal chains",
            Self::HistoryGeo => "events, people, places, timelines and historical causes",
            Self::Literature => "characters, plot, themes, imagery and narrative relationships",
            Self::Lifestyle => "practices, ingredients, activities and practical advice",
            Self::General => "the core concepts of the section and the key causal relationships",
        }
    }
}

impl fmt::Display for BookCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn build_extraction_prompt(chunk_text: &str, category: BookCategory, caps: &ExtractionCaps) -> String {
    format!(
        r#"You are an expert at building knowledge graphs from books.
Extract only the key, reusable entities and relations in the text and ignore noise.

RULES:
1. Entities are short core nouns: concepts, people, organizations, places, technologies, events.
2. Deduplicate entities and keep only those that represent the section's subject.
3. Every relation needs an evidence sentence quoted from the text. Do not infer.
4. Order by importance. At most {max_entities} entities and {max_relations} relations.
5. Return strict JSON with only the keys "entities" and "relations". No code fences, no commentary.
6. "count" is roughly how often the entity occurs in the text, at least 1.

DOMAIN FOCUS: {focus}.

SCHEMA:
{{
  "entities": [
    {{"name": "EntityName", "type": "Type", "count": 3}}
  ],
  "relations": [
    {{"source": "EntityA", "target": "EntityB", "relation": "relation", "evidence": "short quote"}}
  ]
}}
No other fields are allowed.

TEXT:
{chunk_text}
"#,
        max_entities = caps.max_entities,
        max_relations = caps.max_relations,
        focus = category.focus(),
    )
}
