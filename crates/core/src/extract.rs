use std::fs;
use std::path::Path;

use html2text::from_read;
use pulldown_cmark::{html, Parser};

use crate::document::PageText;
use crate::error::{CoreError, Result};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt", "text", "md", "markdown", "html", "htm"];

/// Turns a source file into ordered page texts.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<PageText>>;
}

/// Extractor dispatching on file extension.
///
/// Plain text and markup files are paginated on form feed characters, PDFs use
/// the embedded text layer page by page.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileExtractor;

impl TextExtractor for FileExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<PageText>> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|s| s.to_lowercase());

        match ext.as_deref() {
            Some("txt") | Some("text") => {
                let content = read_text_lossy(path)?;
                Ok(text_to_pages(&content, |page| page.to_string()))
            }
            Some("md") | Some("markdown") => {
                let content = read_text_lossy(path)?;
                Ok(text_to_pages(&content, markdown_to_text))
            }
            Some("html") | Some("htm") => {
                let content = read_text_lossy(path)?;
                Ok(text_to_pages(&content, html_to_plaintext))
            }
            Some("pdf") => pdf_to_pages(path),
            _ => Err(CoreError::UnsupportedInput(path.to_path_buf())),
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collapses runs of whitespace into single spaces.
pub fn clean_page_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_to_pages<F>(text: &str, convert: F) -> Vec<PageText>
where
    F: Fn(&str) -> String,
{
    text.split('\u{c}')
        .enumerate()
        .map(|(idx, page)| PageText::new(idx as u32 + 1, convert(page)))
        .collect()
}

#[cfg(feature = "pdf")]
fn pdf_to_pages(path: &Path) -> Result<Vec<PageText>> {
    // pdf-extract panics on some malformed files
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_by_pages(path))
        .map_err(|_| CoreError::PdfExtract {
            path: path.to_path_buf(),
            message: "extractor panicked on malformed input".to_string(),
        })?;
    let pages = extracted.map_err(|e| CoreError::PdfExtract {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(idx, text)| PageText::new(idx as u32 + 1, text))
        .collect())
}

#[cfg(not(feature = "pdf"))]
fn pdf_to_pages(path: &Path) -> Result<Vec<PageText>> {
    Err(CoreError::PdfSupportDisabled(path.to_path_buf()))
}

fn markdown_to_text(md: &str) -> String {
    let mut html_buf = String::new();
    html::push_html(&mut html_buf, Parser::new(md));
    html_to_plaintext(&html_buf)
}

fn html_to_plaintext(html_src: &str) -> String {
    from_read(html_src.as_bytes(), 80)
}

fn read_text_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn text_files_paginate_on_form_feed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manual.txt");
        fs::write(&path, "first page\u{c}second page\u{c}third").unwrap();

        let pages = FileExtractor.extract(&path).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], PageText::new(1, "first page"));
        assert_eq!(pages[2].number, 3);
    }

    #[test]
    fn markdown_is_flattened() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guide.md");
        fs::write(&path, "# Setup\n\nInstall the **pump** first.").unwrap();

        let pages = FileExtractor.extract(&path).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].text.contains("Setup"));
        assert!(pages[0].text.contains("pump"));
        assert!(!pages[0].text.contains("<strong>"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sheet.xlsx");
        fs::write(&path, "bytes").unwrap();
        assert!(matches!(
            FileExtractor.extract(&path),
            Err(CoreError::UnsupportedInput(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = FileExtractor.extract(&dir.path().join("gone.txt")).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[cfg(feature = "pdf")]
    #[test]
    fn corrupt_pdf_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        fs::write(&path, "this is not a pdf").unwrap();
        assert!(matches!(
            FileExtractor.extract(&path),
            Err(CoreError::PdfExtract { .. })
        ));
    }

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(clean_page_text("  a\n\n b\t c "), "a b c");
    }
}
