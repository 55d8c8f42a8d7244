use crate::error::StructureError;
use crate::source::{OutlineEntry, SourceText};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

const TOC_MARKERS: [&str; 3] = ["目录", "Contents", "CONTENTS"];
const PLACEHOLDER_TITLE: &str = "full content";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StructureOptions {
    /// Leading pages searched for a table of contents.
    pub toc_scan_pages: usize,
    /// Chapter marker candidates longer than this are treated as prose.
    pub max_marker_line_chars: usize,
    pub min_toc_title_chars: usize,
    pub max_toc_title_chars: usize,
}

impl Default for StructureOptions {
    fn default() -> Self {
        Self {
            toc_scan_pages: 6,
            max_marker_line_chars: 60,
            min_toc_title_chars: 2,
            max_toc_title_chars: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionRange {
    pub title: String,
    pub level: u8,
    pub start_char: usize,
    pub end_char: usize,
}

/// Which structural signal produced the sections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StructureSource {
    Bookmarks,
    TableOfContents,
    Headings,
    ChapterMarkers,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveredStructure {
    pub title: Option<String>,
    pub source: StructureSource,
    pub sections: Vec<SectionRange>,
}

/// A chapter title anchored to a 0-based page.
#[derive(Debug, Clone)]
struct PageHint {
    title: String,
    page: usize,
}

/// Derives ordered, contiguous sections covering the whole text.
///
/// Signals are tried in order: bookmark outline, table of contents, line
/// initial `#` headings, then chapter numbering idioms. The first two need a
/// page offset table. A document with none of them is an error rather than a
/// single implicit section.
pub fn recover_structure(
    source: &SourceText,
    options: &StructureOptions,
) -> Result<RecoveredStructure, StructureError> {
    if source.text().trim().is_empty() {
        return Err(StructureError::EmptyDocument);
    }

    if let Some(offsets) = source.page_offsets() {
        check_page_offsets(offsets, source.total_chars())?;

        if let Some(outline) = source.outline() {
            let last_page = offsets.len().saturating_sub(1);
            let mut hints = bookmark_hints(outline);
            for hint in &mut hints {
                hint.page = hint.page.min(last_page);
            }

            let distinct_pages = distinct_page_count(&hints);
            let sections = if distinct_pages <= 1 && offsets.len() > 1 {
                Vec::new()
            } else {
                sections_from_pages(hints, offsets, source.total_chars())
            };
            if sections.len() > 1 || (offsets.len() == 1 && !sections.is_empty()) {
                return Ok(finish(None, StructureSource::Bookmarks, sections));
            }
            debug!(
                distinct_pages,
                pages = offsets.len(),
                "outline collapses to a single section, ignoring it"
            );
        }

        let hints = scan_table_of_contents(source, options)?;
        let sections = sections_from_pages(hints, offsets, source.total_chars());
        if !sections.is_empty() {
            return Ok(finish(None, StructureSource::TableOfContents, sections));
        }
    }

    if let Some((title, sections)) = scan_headings(source.text(), source.total_chars())? {
        return Ok(finish(title, StructureSource::Headings, sections));
    }

    let sections = scan_chapter_markers(source.text(), source.total_chars(), options)?;
    if !sections.is_empty() {
        return Ok(finish(None, StructureSource::ChapterMarkers, sections));
    }

    Err(StructureError::NoStructuralSignal)
}

fn finish(title: Option<String>, source: StructureSource, mut sections: Vec<SectionRange>) -> RecoveredStructure {
    for (index, section) in sections.iter_mut().enumerate() {
        section.title = normalize_title(&section.title, index);
    }
    debug!(?source, sections = sections.len(), "recovered document structure");
    RecoveredStructure { title, source, sections }
}

/// Blank and placeholder titles become `Section N`.
pub fn normalize_title(title: &str, index: usize) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(PLACEHOLDER_TITLE) {
        format!("Section {}", index + 1)
    } else {
        trimmed.to_string()
    }
}

fn check_page_offsets(offsets: &[usize], total: usize) -> Result<(), StructureError> {
    match offsets.first() {
        None => return Err(StructureError::InvalidPageOffsets("table is empty".to_string())),
        Some(&first) if first != 0 => {
            return Err(StructureError::InvalidPageOffsets(format!(
                "first page starts at {first}, expected 0"
            )))
        }
        Some(_) => {}
    }
    if offsets.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(StructureError::InvalidPageOffsets("offsets are not sorted".to_string()));
    }
    if offsets.iter().any(|offset| *offset > total) {
        return Err(StructureError::InvalidPageOffsets(format!(
            "an offset lies past the end of the text ({total} chars)"
        )));
    }
    Ok(())
}

/// Keeps only the shallowest outline level, assumed to be the chapters.
fn bookmark_hints(outline: &[OutlineEntry]) -> Vec<PageHint> {
    let entries = outline
        .iter()
        .filter(|entry| !entry.title.trim().is_empty())
        .collect::<Vec<_>>();
    let Some(min_level) = entries.iter().map(|entry| entry.level).min() else {
        return Vec::new();
    };

    entries
        .into_iter()
        .filter(|entry| entry.level == min_level)
        .map(|entry| PageHint {
            title: entry.title.trim().to_string(),
            page: entry.page.saturating_sub(1) as usize,
        })
        .collect()
}

fn distinct_page_count(hints: &[PageHint]) -> usize {
    let mut pages = hints.iter().map(|hint| hint.page).collect::<Vec<_>>();
    pages.sort_unstable();
    pages.dedup();
    pages.len()
}

/// Each chapter runs from its page to the start of the next chapter's page.
/// Text before the first chapter page is folded into the first section.
fn sections_from_pages(mut hints: Vec<PageHint>, offsets: &[usize], total: usize) -> Vec<SectionRange> {
    let last_page = offsets.len().saturating_sub(1);
    for hint in &mut hints {
        hint.page = hint.page.min(last_page);
    }
    hints.retain(|hint| !hint.title.is_empty());
    hints.sort_by_key(|hint| hint.page);
    hints.dedup_by_key(|hint| hint.page);

    let starts = hints
        .iter()
        .enumerate()
        .map(|(index, hint)| if index == 0 { 0 } else { offsets[hint.page] })
        .collect::<Vec<_>>();

    hints
        .into_iter()
        .enumerate()
        .map(|(index, hint)| SectionRange {
            title: hint.title,
            level: 1,
            start_char: starts[index],
            end_char: starts.get(index + 1).copied().unwrap_or(total),
        })
        .filter(|section| section.end_char > section.start_char)
        .collect()
}

fn scan_table_of_contents(
    source: &SourceText,
    options: &StructureOptions,
) -> Result<Vec<PageHint>, StructureError> {
    let dotted = Regex::new(r"^(.+?)\.{2,}\s*(\d{1,4})$")?;
    let spaced = Regex::new(r"^(.+?)\s+(\d{1,4})$")?;
    let whitespace = Regex::new(r"\s+")?;

    let mut hints = Vec::new();
    for page_index in 0..source.page_count().min(options.toc_scan_pages) {
        let Some(page) = source.page_text(page_index) else {
            break;
        };
        if !TOC_MARKERS.iter().any(|marker| page.contains(marker)) {
            continue;
        }

        for line in page.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if TOC_MARKERS.iter().any(|marker| line.contains(marker)) {
                continue;
            }
            let line = whitespace.replace_all(line, " ");
            let Some(captures) = dotted.captures(&line).or_else(|| spaced.captures(&line)) else {
                continue;
            };

            let title = captures[1].trim();
            let title_chars = title.chars().count();
            if title_chars < options.min_toc_title_chars || title_chars > options.max_toc_title_chars {
                continue;
            }
            let Ok(page_number) = captures[2].parse::<usize>() else {
                continue;
            };
            hints.push(PageHint {
                title: title.to_string(),
                page: page_number.saturating_sub(1),
            });
        }

        if !hints.is_empty() {
            debug!(page = page_index, entries = hints.len(), "parsed table of contents");
            break;
        }
    }

    Ok(hints)
}

/// Byte to char offset conversion for a forward-only sequence of positions.
struct CharCursor<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, byte: 0, chars: 0 }
    }

    fn advance_to(&mut self, byte: usize) -> usize {
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// A leading level-1 heading followed by further headings is the book title.
fn scan_headings(text: &str, total: usize) -> Result<Option<(Option<String>, Vec<SectionRange>)>, StructureError> {
    let heading = Regex::new(r"(?m)^[ \t]*(#{1,4})[ \t]+(.+)$")?;

    let mut cursor = CharCursor::new(text);
    let mut found = Vec::new();
    for captures in heading.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let title = captures[2].trim().trim_end_matches('#').trim().to_string();
        found.push((captures[1].len() as u8, title, cursor.advance_to(whole.start())));
    }
    if found.is_empty() {
        return Ok(None);
    }

    let mut book_title = None;
    if found[0].0 == 1 {
        book_title = Some(found[0].1.clone());
        if found.len() > 1 {
            found.remove(0);
        }
    }

    let mut sections = Vec::with_capacity(found.len());
    for (index, (level, title, start)) in found.iter().enumerate() {
        sections.push(SectionRange {
            title: title.clone(),
            level: *level,
            start_char: if index == 0 { 0 } else { *start },
            end_char: found.get(index + 1).map_or(total, |next| next.2),
        });
    }

    Ok(Some((book_title, sections)))
}

fn scan_chapter_markers(
    text: &str,
    total: usize,
    options: &StructureOptions,
) -> Result<Vec<SectionRange>, StructureError> {
    let patterns = [
        Regex::new(r"^第[\d一二三四五六七八九十百千]+[章节回](\s+.*)?$")?,
        Regex::new(r"^(CHAPTER|Chapter)\s+\d+[:.\s-].+")?,
        Regex::new(r"^(CHAPTER|Chapter)\s+\d+\s*$")?,
    ];

    let mut markers = Vec::new();
    let mut cursor = 0;
    for line in text.split_inclusive('\n') {
        let stripped = line.trim();
        if !stripped.is_empty()
            && stripped.chars().count() <= options.max_marker_line_chars
            && patterns.iter().any(|pattern| pattern.is_match(stripped))
        {
            markers.push((stripped.to_string(), cursor));
        }
        cursor += line.chars().count();
    }

    Ok(markers
        .iter()
        .enumerate()
        .map(|(index, (title, start))| SectionRange {
            title: title.clone(),
            level: 1,
            start_char: if index == 0 { 0 } else { *start },
            end_char: markers.get(index + 1).map_or(total, |next| next.1),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PageText;

    fn paged(texts: &[&str]) -> SourceText {
        let pages = texts
            .iter()
            .enumerate()
            .map(|(index, text)| PageText {
                number: index as u32 + 1,
                text: text.to_string(),
            })
            .collect::<Vec<_>>();
        SourceText::from_pages(&pages)
    }

    fn entry(level: u32, title: &str, page: u32) -> OutlineEntry {
        OutlineEntry {
            level,
            title: title.to_string(),
            page,
        }
    }

    fn assert_partition(sections: &[SectionRange], total: usize) {
        assert!(!sections.is_empty());
        assert_eq!(sections[0].start_char, 0);
        assert_eq!(sections.last().map(|section| section.end_char), Some(total));
        for pair in sections.windows(2) {
            assert_eq!(pair[0].end_char, pair[1].start_char);
        }
        assert!(sections.iter().all(|section| section.end_char > section.start_char));
    }

    #[test]
    fn bookmarks_use_top_level_entries_in_page_order() {
        let source = paged(&["cover", "one body", "one more", "two body", "three body"]).with_outline(vec![
            entry(1, "Three", 5),
            entry(1, "One", 2),
            entry(2, "One point one", 3),
            entry(1, "Two", 4),
        ]);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::Bookmarks);
        let titles = recovered.sections.iter().map(|s| s.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, ["One", "Two", "Three"]);
        assert_partition(&recovered.sections, source.total_chars());

        let offsets = source.page_offsets().unwrap();
        assert_eq!(recovered.sections[1].start_char, offsets[3]);
        assert_eq!(recovered.sections[2].start_char, offsets[4]);
    }

    #[test]
    fn outlines_spanning_pages_always_partition_the_text() {
        let pages = ["a", "bb", "", "dddd", "eeeee", "f", "gg"];
        let outlines = [
            vec![entry(1, "x", 1), entry(1, "y", 7)],
            vec![entry(0, "x", 3), entry(0, "y", 3), entry(0, "z", 5)],
            vec![entry(2, "x", 2), entry(2, "y", 40), entry(3, "deep", 4)],
            vec![entry(1, "x", 6), entry(1, "y", 1), entry(1, "z", 4), entry(1, "w", 2)],
        ];
        for outline in outlines {
            let source = paged(&pages).with_outline(outline);
            let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
            assert_eq!(recovered.source, StructureSource::Bookmarks);
            assert_partition(&recovered.sections, source.total_chars());
        }
    }

    #[test]
    fn single_page_outline_on_multi_page_document_falls_back() {
        let source = paged(&[
            "Contents\nIntroduction ........ 2\nMethods 3",
            "Introduction text",
            "Methods text",
        ])
        .with_outline(vec![entry(1, "Everything", 1), entry(1, "Again", 1)]);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::TableOfContents);
        let titles = recovered.sections.iter().map(|s| s.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, ["Introduction", "Methods"]);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn outline_pointing_past_the_last_page_falls_back() {
        let source = paged(&[
            "Contents\nIntroduction ........ 2\nMethods 3",
            "Introduction text",
            "Methods text",
        ])
        .with_outline(vec![entry(1, "Part one", 40), entry(1, "Part two", 50)]);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_ne!(recovered.source, StructureSource::Bookmarks);
        assert_eq!(recovered.source, StructureSource::TableOfContents);
        assert_eq!(recovered.sections.len(), 2);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn single_page_document_accepts_a_one_page_outline() {
        let source = paged(&["only page"]).with_outline(vec![entry(1, "Whole", 1)]);
        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::Bookmarks);
        assert_eq!(recovered.sections.len(), 1);
    }

    #[test]
    fn table_of_contents_filters_titles_by_length() {
        let long_title = "L".repeat(41);
        let toc = format!("目录\n第一章 绪论........3\nX 9\n{long_title} 4\n第二章 方法  4\n");
        let source = paged(&["封面", &toc, "front", "第一章", "第二章"]);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::TableOfContents);
        let titles = recovered.sections.iter().map(|s| s.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, ["第一章 绪论", "第二章 方法"]);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn markdown_headings_detect_book_title() {
        let text = "preface\n# The Book\nintro\n## Part One\nbody\n### Detail\nmore\n## Part Two\nend\n";
        let source = SourceText::from_plain_text(text);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::Headings);
        assert_eq!(recovered.title.as_deref(), Some("The Book"));
        let shape = recovered
            .sections
            .iter()
            .map(|s| (s.title.as_str(), s.level))
            .collect::<Vec<_>>();
        assert_eq!(shape, [("Part One", 2), ("Detail", 3), ("Part Two", 2)]);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn lone_title_heading_is_also_the_only_section() {
        let source = SourceText::from_plain_text("# Notes\nsome text");
        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.title.as_deref(), Some("Notes"));
        assert_eq!(recovered.sections.len(), 1);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn chapter_markers_ignore_long_prose_lines() {
        let prose = format!("Chapter 3 was mentioned in passing {}", "and so on ".repeat(6));
        let text = format!("第一章 开始\n内容\n{prose}\nChapter 2: Next Steps\nbody\nCHAPTER 4\nend");
        let source = SourceText::from_plain_text(text);

        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.source, StructureSource::ChapterMarkers);
        let titles = recovered.sections.iter().map(|s| s.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, ["第一章 开始", "Chapter 2: Next Steps", "CHAPTER 4"]);
        assert_partition(&recovered.sections, source.total_chars());
    }

    #[test]
    fn missing_structure_is_an_error() {
        let source = SourceText::from_plain_text("just a paragraph of text\nwith no chapters at all");
        assert!(matches!(
            recover_structure(&source, &StructureOptions::default()),
            Err(StructureError::NoStructuralSignal)
        ));

        let blank = SourceText::from_plain_text("  \n ");
        assert!(matches!(
            recover_structure(&blank, &StructureOptions::default()),
            Err(StructureError::EmptyDocument)
        ));
    }

    #[test]
    fn malformed_offset_table_is_rejected() {
        let source = SourceText::from_plain_text("# A\ntext").with_page_offsets(vec![0, 5, 3]);
        assert!(matches!(
            recover_structure(&source, &StructureOptions::default()),
            Err(StructureError::InvalidPageOffsets(_))
        ));
    }

    #[test]
    fn placeholder_titles_are_numbered() {
        let source = paged(&["a", "b"]).with_outline(vec![entry(1, "Full Content", 1), entry(1, "Real", 2)]);
        let recovered = recover_structure(&source, &StructureOptions::default()).unwrap();
        assert_eq!(recovered.sections[0].title, "Section 1");
        assert_eq!(recovered.sections[1].title, "Real");
    }
}
