use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extract::is_supported;

/// A source document known to the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub doc_name: String,
    pub source_path: PathBuf,
}

impl DocumentRecord {
    pub fn from_path(path: &Path, strategy: DocIdStrategy) -> Self {
        let doc_name = file_name(path);
        let doc_id = match strategy {
            DocIdStrategy::Filename => normalize_doc_id(&doc_name),
            DocIdStrategy::Random => random_doc_id(),
        };
        Self {
            doc_id,
            doc_name,
            source_path: path.to_path_buf(),
        }
    }
}

/// Text of one page, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

impl PageText {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocIdStrategy {
    #[default]
    Filename,
    Random,
}

/// Entry returned by [`list_documents`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentEntry {
    pub id: String,
    pub name: String,
}

pub fn normalize_doc_id(file_name: &str) -> String {
    file_name.trim().replace(' ', "_")
}

pub fn random_doc_id() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Lists the documents available for querying from the source folder.
///
/// Ids are derived from file names, so the listing never consults the index.
/// A missing folder lists as empty.
pub fn list_documents(dir: &Path) -> Result<Vec<DocumentEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_supported(&path) {
            continue;
        }
        let name = file_name(&path);
        entries.push(DocumentEntry {
            id: normalize_doc_id(&name),
            name,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn filename_ids_replace_spaces() {
        let record = DocumentRecord::from_path(
            Path::new("/docs/Annual Report 2023.pdf"),
            DocIdStrategy::Filename,
        );
        assert_eq!(record.doc_id, "Annual_Report_2023.pdf");
        assert_eq!(record.doc_name, "Annual Report 2023.pdf");
    }

    #[test]
    fn random_ids_are_short_hex() {
        let id = random_doc_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn listing_skips_unsupported_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b manual.txt"), "text").unwrap();
        std::fs::write(dir.path().join("a.pdf"), "%PDF").unwrap();
        std::fs::write(dir.path().join("notes.docx"), "zip").unwrap();
        std::fs::create_dir(dir.path().join("nested.txt")).unwrap();

        let listed = list_documents(dir.path()).unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b manual.txt"]);
        assert_eq!(listed[1].id, "b_manual.txt");
    }

    #[test]
    fn listing_missing_folder_is_empty() {
        let dir = tempdir().unwrap();
        let listed = list_documents(&dir.path().join("absent")).unwrap();
        assert!(listed.is_empty());
    }
}
