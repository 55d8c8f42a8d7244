use crate::error::IngestError;
use lopdf::Document as PdfDocument;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const PAGE_SEPARATOR: &str = "\n\n";
const FORM_FEED: char = '\u{000c}';

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// One bookmark entry. `page` is 1-based, as PDF viewers report it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutlineEntry {
    pub level: u32,
    pub title: String,
    pub page: u32,
}

/// Extracted document text plus the optional structural hints that came with it.
#[derive(Debug, Clone)]
pub struct SourceText {
    text: String,
    total_chars: usize,
    page_offsets: Option<Vec<usize>>,
    outline: Option<Vec<OutlineEntry>>,
}

impl SourceText {
    /// Joins pages with a blank line and records each page's first character offset.
    pub fn from_pages(pages: &[PageText]) -> Self {
        let mut text = String::new();
        let mut offsets = Vec::with_capacity(pages.len());
        let mut cursor = 0;

        for (index, page) in pages.iter().enumerate() {
            offsets.push(cursor);
            text.push_str(&page.text);
            cursor += page.text.chars().count();
            if index + 1 < pages.len() {
                text.push_str(PAGE_SEPARATOR);
                cursor += PAGE_SEPARATOR.len();
            }
        }

        Self {
            text,
            total_chars: cursor,
            page_offsets: Some(offsets),
            outline: None,
        }
    }

    /// Plain text is paginated on form feeds when it has any.
    pub fn from_plain_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.contains(FORM_FEED) {
            let pages = text
                .split(FORM_FEED)
                .enumerate()
                .map(|(index, page)| PageText {
                    number: (index + 1) as u32,
                    text: page.to_string(),
                })
                .collect::<Vec<_>>();
            return Self::from_pages(&pages);
        }

        let total_chars = text.chars().count();
        Self {
            text,
            total_chars,
            page_offsets: None,
            outline: None,
        }
    }

    pub fn with_page_offsets(mut self, offsets: Vec<usize>) -> Self {
        self.page_offsets = Some(offsets);
        self
    }

    pub fn with_outline(mut self, outline: Vec<OutlineEntry>) -> Self {
        self.outline = Some(outline);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn page_offsets(&self) -> Option<&[usize]> {
        self.page_offsets.as_deref()
    }

    pub fn outline(&self) -> Option<&[OutlineEntry]> {
        self.outline.as_deref()
    }

    pub fn page_count(&self) -> usize {
        self.page_offsets.as_ref().map_or(0, Vec::len)
    }

    /// Text of the 0-based page `index`, as bounded by the offset table.
    pub fn page_text(&self, index: usize) -> Option<&str> {
        let offsets = self.page_offsets.as_ref()?;
        let start = *offsets.get(index)?;
        let end = offsets.get(index + 1).copied().unwrap_or(self.total_chars);
        Some(self.slice(start, end))
    }

    /// The `[start, end)` character range, clamped to the text.
    pub fn slice(&self, start: usize, end: usize) -> &str {
        slice_chars(&self.text, start, end)
    }

    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

pub fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    if start >= end {
        return "";
    }
    let mut boundaries = text.char_indices().map(|(byte, _)| byte).chain(std::iter::once(text.len()));
    let Some(start_byte) = boundaries.nth(start) else {
        return "";
    };
    let end_byte = boundaries.nth(end - start - 1).unwrap_or(text.len());
    &text[start_byte..end_byte]
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    /// Blank pages are kept so page numbers keep lining up with bookmarks.
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document = PdfDocument::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;
            pages.push(PageText { number: page_no, text });
        }

        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Reads a PDF through `lopdf`, anything else as UTF-8 text.
pub fn load_source(path: &Path) -> Result<SourceText, IngestError> {
    if is_pdf(path) {
        let pages = LopdfExtractor.extract_pages(path)?;
        return Ok(SourceText::from_pages(&pages));
    }
    let text = std::fs::read_to_string(path)?;
    Ok(SourceText::from_plain_text(text))
}

/// Loads a bookmark sidecar: `[{"level": 1, "title": "...", "page": 3}, ...]`.
pub fn load_outline(path: &Path) -> Result<Vec<OutlineEntry>, IngestError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn document_title(path: &Path) -> Result<String, IngestError> {
    path.file_stem()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file() && is_pdf(entry.path()))
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<_>>();

    files.sort_unstable();
    files
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    #[test]
    fn pages_are_joined_and_offsets_recorded() {
        let source = SourceText::from_pages(&[page(1, "Cover"), page(2, ""), page(3, "第一章 开始")]);

        assert_eq!(source.text(), "Cover\n\n\n\n第一章 开始");
        assert_eq!(source.page_offsets(), Some(&[0, 7, 9][..]));
        assert_eq!(source.total_chars(), 15);
        assert_eq!(source.page_text(2), Some("第一章 开始"));
        assert_eq!(source.page_text(0), Some("Cover\n\n"));
        assert_eq!(source.page_text(3), None);
    }

    #[test]
    fn form_feeds_paginate_plain_text() {
        let source = SourceText::from_plain_text("First\u{000C}Second");
        assert_eq!(source.page_count(), 2);
        assert_eq!(source.text(), "First\n\nSecond");

        let unpaged = SourceText::from_plain_text("no pages here");
        assert_eq!(unpaged.page_offsets(), None);
        assert_eq!(unpaged.total_chars(), 13);
    }

    #[test]
    fn char_slices_handle_multibyte_text() {
        let text = "a知识b";
        assert_eq!(slice_chars(text, 1, 3), "知识");
        assert_eq!(slice_chars(text, 0, 10), "a知识b");
        assert_eq!(slice_chars(text, 3, 4), "b");
        assert_eq!(slice_chars(text, 4, 4), "");
        assert_eq!(slice_chars(text, 9, 12), "");
    }

    #[test]
    fn checksum_is_reproducible() {
        let first = SourceText::from_plain_text("same text").checksum();
        let second = SourceText::from_plain_text("same text").checksum();
        assert_eq!(first, second);
        assert_ne!(first, SourceText::from_plain_text("other").checksum());
    }

    #[test]
    fn outline_sidecar_is_parsed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("outline.json");
        fs::write(
            &path,
            r#"[{"level": 1, "title": "Intro", "page": 1}, {"level": 2, "title": "Detail", "page": 2}]"#,
        )?;

        let outline = load_outline(&path)?;
        assert_eq!(outline.len(), 2);
        assert_eq!(outline[1].title, "Detail");
        Ok(())
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(base.join("notes.txt")).and_then(|mut file| file.write_all(b"text"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn unreadable_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(load_source(&path), Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn text_files_load_as_plain_text() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("book.md");
        fs::write(&path, "# Title\n\n## One\nbody\n")?;

        let source = load_source(&path)?;
        assert_eq!(source.page_offsets(), None);
        assert_eq!(document_title(&path)?, "book");
        Ok(())
    }
}
