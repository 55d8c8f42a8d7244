use crate::error::ChunkError;
use serde::{Deserialize, Serialize};

/// How a section is cut into provider calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChunkingPolicy {
    /// Fixed windows of `size` characters, each starting `overlap` characters
    /// before the previous one ended.
    SlidingWindow {
        size: usize,
        overlap: usize,
        #[serde(default)]
        max_chunks: Option<usize>,
    },
    /// `ceil(units / unit_budget)` equal character slices.
    EvenSplit {
        unit_budget: usize,
        #[serde(default)]
        max_chunks: Option<usize>,
    },
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self::SlidingWindow {
            size: 1_500,
            overlap: 200,
            max_chunks: None,
        }
    }
}

impl ChunkingPolicy {
    pub fn validate(&self) -> Result<(), ChunkError> {
        match *self {
            Self::SlidingWindow { size, overlap, max_chunks } => {
                if size == 0 {
                    return Err(ChunkError::InvalidConfig("window size must be positive".to_string()));
                }
                if overlap >= size {
                    return Err(ChunkError::InvalidConfig(format!(
                        "overlap {overlap} must be smaller than window size {size}"
                    )));
                }
                check_max_chunks(max_chunks)
            }
            Self::EvenSplit { unit_budget, max_chunks } => {
                if unit_budget == 0 {
                    return Err(ChunkError::InvalidConfig("unit budget must be positive".to_string()));
                }
                check_max_chunks(max_chunks)
            }
        }
    }

    pub fn max_chunks(&self) -> Option<usize> {
        match *self {
            Self::SlidingWindow { max_chunks, .. } | Self::EvenSplit { max_chunks, .. } => max_chunks,
        }
    }
}

fn check_max_chunks(max_chunks: Option<usize>) -> Result<(), ChunkError> {
    if max_chunks == Some(0) {
        return Err(ChunkError::InvalidConfig("max_chunks must be positive".to_string()));
    }
    Ok(())
}

/// A chunk's `[start, end)` character range within its section and its trimmed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Cheap cost proxy for mixed-language text: CJK code points plus Latin words.
pub fn count_units(text: &str) -> usize {
    let mut units = 0;
    let mut in_word = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if is_cjk(ch) {
            units += 1;
            in_word = false;
        } else if ch.is_ascii_alphabetic() {
            if !in_word {
                units += 1;
                in_word = true;
            }
        } else if ch == '\'' && in_word && chars.peek().is_some_and(|next| next.is_ascii_alphabetic()) {
            // contractions such as "don't" stay one word
        } else {
            in_word = false;
        }
    }

    units
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch,
        '\u{3400}'..='\u{4dbf}' | '\u{4e00}'..='\u{9fff}' | '\u{f900}'..='\u{faff}'
    )
}

pub fn split_with_overlap(text: &str, size: usize, overlap: usize) -> Result<Vec<ChunkSpan>, ChunkError> {
    ChunkingPolicy::SlidingWindow { size, overlap, max_chunks: None }.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let mut spans = SpanCollector::default();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        spans.push(&chars, start, end);
        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap);
    }

    Ok(spans.finish())
}

pub fn split_evenly(text: &str, count: usize) -> Vec<ChunkSpan> {
    let chars: Vec<char> = text.chars().collect();
    if count == 0 || chars.is_empty() {
        return Vec::new();
    }

    let size = chars.len().div_ceil(count).max(1);
    let mut spans = SpanCollector::default();
    for index in 0..count {
        let start = index * size;
        if start >= chars.len() {
            break;
        }
        let end = (start + size).min(chars.len());
        spans.push(&chars, start, end);
    }

    spans.finish()
}

/// Cuts a section under `policy`. Whitespace-only text yields no chunks.
pub fn plan_chunks(text: &str, policy: &ChunkingPolicy) -> Result<Vec<ChunkSpan>, ChunkError> {
    policy.validate()?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let units = count_units(text);
    let spans = match *policy {
        ChunkingPolicy::SlidingWindow { size, overlap, .. } => split_with_overlap(text, size, overlap)?,
        ChunkingPolicy::EvenSplit { unit_budget, max_chunks } => {
            let required = units.div_ceil(unit_budget).max(1);
            if let Some(allowed) = max_chunks.filter(|allowed| required > *allowed) {
                return Err(ChunkError::BudgetExceeded { units, required, allowed });
            }
            split_evenly(text, required)
        }
    };

    if let Some(allowed) = policy.max_chunks().filter(|allowed| spans.len() > *allowed) {
        return Err(ChunkError::BudgetExceeded {
            units,
            required: spans.len(),
            allowed,
        });
    }

    Ok(spans)
}

/// Collects trimmed slices. A slice that trims to nothing is folded into its
/// neighbour's range so the ranges still cover the whole input.
#[derive(Default)]
struct SpanCollector {
    spans: Vec<ChunkSpan>,
    uncovered_from: Option<usize>,
}

impl SpanCollector {
    fn push(&mut self, chars: &[char], start: usize, end: usize) {
        let raw: String = chars[start..end].iter().collect();
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            match self.spans.last_mut() {
                Some(previous) => previous.end = previous.end.max(end),
                None => {
                    self.uncovered_from.get_or_insert(start);
                }
            }
            return;
        }

        let start = self.uncovered_from.take().unwrap_or(start);
        self.spans.push(ChunkSpan {
            start,
            end,
            text: trimmed.to_string(),
        });
    }

    fn finish(self) -> Vec<ChunkSpan> {
        self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(spans: &[ChunkSpan], len: usize, allow_overlap: bool) {
        assert!(!spans.is_empty());
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().map(|span| span.end), Some(len));
        for pair in spans.windows(2) {
            if allow_overlap {
                assert!(pair[1].start <= pair[0].end, "gap between {pair:?}");
                assert!(pair[1].start > pair[0].start);
            } else {
                assert_eq!(pair[1].start, pair[0].end, "ranges must be contiguous");
            }
        }
        for span in spans {
            assert!(!span.text.trim().is_empty());
            assert_eq!(span.text, span.text.trim());
        }
    }

    #[test]
    fn units_count_cjk_characters_and_latin_words() {
        assert_eq!(count_units("Hello world"), 2);
        assert_eq!(count_units("知识图谱"), 4);
        assert_eq!(count_units("Rust 是一门语言, don't panic!"), 3 + 5);
        assert_eq!(count_units("1234 -- ..."), 0);
        assert_eq!(count_units(""), 0);
    }

    #[test]
    fn sliding_window_overlaps_and_covers_input() {
        let text = "abcdefghij".repeat(5);
        let spans = split_with_overlap(&text, 20, 5).unwrap();

        assert_eq!(spans[0], ChunkSpan { start: 0, end: 20, text: text[..20].to_string() });
        assert_eq!(spans[1].start, 15);
        assert_covers(&spans, 50, true);
    }

    #[test]
    fn sliding_window_rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            split_with_overlap("text", 10, 10),
            Err(ChunkError::InvalidConfig(_))
        ));
        assert!(split_with_overlap("text", 0, 0).is_err());
    }

    #[test]
    fn even_split_produces_contiguous_slices() {
        let text = "one two three four five six seven eight nine ten";
        let spans = split_evenly(text, 3);

        assert_eq!(spans.len(), 3);
        assert_covers(&spans, text.chars().count(), false);
    }

    #[test]
    fn whitespace_only_slices_are_folded_into_neighbours() {
        let text = format!("alpha{}omega", " ".repeat(30));
        let spans = split_evenly(&text, 4);

        assert!(spans.iter().all(|span| !span.text.is_empty()));
        assert_covers(&spans, text.chars().count(), false);

        let leading = format!("{}tail", " ".repeat(12));
        let spans = split_with_overlap(&leading, 4, 1).unwrap();
        assert_covers(&spans, leading.chars().count(), true);
    }

    #[test]
    fn slices_respect_multibyte_characters() {
        let text = "第一章 知识图谱的构建方法与应用";
        let spans = split_evenly(text, 2);
        assert_covers(&spans, text.chars().count(), false);
    }

    #[test]
    fn both_policies_cover_assorted_inputs() {
        let inputs = [
            "x".to_string(),
            "  padded  ".to_string(),
            "line one\n\nline two\n\n\n".repeat(7),
            "混合 text with 中文 and English words ".repeat(11),
        ];
        for input in &inputs {
            let len = input.chars().count();
            for (size, overlap) in [(1, 0), (3, 1), (16, 4), (500, 20)] {
                let spans = split_with_overlap(input, size, overlap).unwrap();
                assert_covers(&spans, len, true);
            }
            for count in [1, 2, 5, 13] {
                let spans = split_evenly(input, count);
                assert_covers(&spans, len, false);
            }
        }
    }

    #[test]
    fn even_split_chunk_count_follows_unit_budget() {
        let text = "word ".repeat(100);
        let policy = ChunkingPolicy::EvenSplit { unit_budget: 30, max_chunks: None };
        let spans = plan_chunks(&text, &policy).unwrap();
        assert_eq!(spans.len(), 4);

        let small = ChunkingPolicy::EvenSplit { unit_budget: 1_000, max_chunks: None };
        let spans = plan_chunks(&text, &small).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end, text.chars().count());
    }

    #[test]
    fn budget_ceiling_is_reported() {
        let text = "word ".repeat(100);
        let capped = ChunkingPolicy::EvenSplit { unit_budget: 30, max_chunks: Some(1) };
        assert_eq!(
            plan_chunks(&text, &capped),
            Err(ChunkError::BudgetExceeded { units: 100, required: 4, allowed: 1 })
        );

        let window = ChunkingPolicy::SlidingWindow { size: 100, overlap: 10, max_chunks: Some(2) };
        assert!(matches!(
            plan_chunks(&text, &window),
            Err(ChunkError::BudgetExceeded { allowed: 2, .. })
        ));
    }

    #[test]
    fn blank_sections_plan_no_chunks() {
        let policy = ChunkingPolicy::default();
        assert!(plan_chunks("   \n\t ", &policy).unwrap().is_empty());
        assert!(plan_chunks("", &policy).unwrap().is_empty());
    }

    #[test]
    fn text_without_units_still_gets_one_chunk() {
        let policy = ChunkingPolicy::EvenSplit { unit_budget: 10, max_chunks: Some(1) };
        let spans = plan_chunks("12345 67890", &policy).unwrap();
        assert_eq!(spans.len(), 1);
    }
}
