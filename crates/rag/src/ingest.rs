use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use docqa_core::{is_supported, DocumentRecord};

use crate::services::ServiceContext;
use crate::store::{IndexPoint, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Exists,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub doc_id: String,
    pub doc_name: String,
    pub chunks: usize,
    pub message: String,
}

impl IngestReport {
    fn new(record: &DocumentRecord, status: IngestStatus, chunks: usize, message: String) -> Self {
        Self {
            status,
            doc_id: record.doc_id.clone(),
            doc_name: record.doc_name.clone(),
            chunks,
            message,
        }
    }
}

/// Extracts, chunks, embeds and stores one file.
///
/// Never returns an error: every outcome is reported through the status.
/// The document is reserved before any work so that concurrent ingestions of
/// the same id report `exists`, and the reservation is always released.
pub fn ingest_file(ctx: &ServiceContext, path: &Path) -> IngestReport {
    let record = DocumentRecord::from_path(path, ctx.config().documents.id_strategy);
    if let Some(report) = reserve(ctx, &record) {
        return report;
    }
    finish_reserved(ctx, &record, index_reserved(ctx, &record))
}

/// Stores an uploaded file in the documents folder and ingests it.
///
/// The name is reduced to its final component and must have a supported
/// extension; otherwise an error is returned. The bytes are written only once
/// the document id is reserved, so an upload that reports `exists` leaves the
/// file on disk untouched.
pub fn ingest_upload(ctx: &ServiceContext, file_name: &str, bytes: &[u8]) -> Result<IngestReport> {
    let dir = &ctx.config().documents.dir;
    let target = upload_target(dir, file_name)?;
    let record = DocumentRecord::from_path(&target, ctx.config().documents.id_strategy);
    if let Some(report) = reserve(ctx, &record) {
        return Ok(report);
    }
    let outcome = write_upload(dir, &target, bytes).and_then(|()| {
        info!(path = %target.display(), bytes = bytes.len(), "upload saved");
        index_reserved(ctx, &record)
    });
    Ok(finish_reserved(ctx, &record, outcome))
}

/// Returns a report when the document cannot be reserved.
fn reserve(ctx: &ServiceContext, record: &DocumentRecord) -> Option<IngestReport> {
    match ctx.index().try_reserve(ctx.collection(), &record.doc_id) {
        Ok(Reservation::Acquired) => None,
        Ok(Reservation::Exists) => {
            info!(doc_id = %record.doc_id, "document already indexed, skipping");
            Some(IngestReport::new(
                record,
                IngestStatus::Exists,
                0,
                "document already indexed".to_string(),
            ))
        }
        Ok(Reservation::InProgress) => {
            info!(doc_id = %record.doc_id, "document ingestion already in progress");
            Some(IngestReport::new(
                record,
                IngestStatus::Exists,
                0,
                "document ingestion already in progress".to_string(),
            ))
        }
        Err(err) => {
            warn!(doc_id = %record.doc_id, error = %err, "failed to reserve document");
            Some(IngestReport::new(record, IngestStatus::Failure, 0, err.to_string()))
        }
    }
}

fn finish_reserved(
    ctx: &ServiceContext,
    record: &DocumentRecord,
    outcome: Result<usize>,
) -> IngestReport {
    if let Err(err) = ctx.index().release(ctx.collection(), &record.doc_id) {
        warn!(doc_id = %record.doc_id, error = %err, "failed to release reservation");
    }
    match outcome {
        Ok(chunks) => {
            info!(doc_id = %record.doc_id, chunks, "document indexed");
            IngestReport::new(
                record,
                IngestStatus::Success,
                chunks,
                format!("indexed {chunks} chunks"),
            )
        }
        Err(err) => {
            warn!(doc_id = %record.doc_id, error = %format!("{err:#}"), "ingestion failed");
            IngestReport::new(record, IngestStatus::Failure, 0, format!("{err:#}"))
        }
    }
}

fn index_reserved(ctx: &ServiceContext, record: &DocumentRecord) -> Result<usize> {
    let pages = ctx
        .extractor()
        .extract(&record.source_path)
        .with_context(|| format!("failed to extract {}", record.source_path.display()))?;
    let chunks = ctx
        .chunker()
        .chunk_document(record, &pages, ctx.embedder())?;
    if chunks.is_empty() {
        return Err(anyhow!("no extractable text in {}", record.doc_name));
    }
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx
        .embedder()
        .embed_batch(&texts)
        .context("failed to embed chunks")?;
    if vectors.len() != chunks.len() {
        return Err(anyhow!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        ));
    }
    let points: Vec<IndexPoint> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| IndexPoint { chunk, vector })
        .collect();
    let written = ctx
        .index()
        .upsert(ctx.collection(), &points)
        .context("failed to write chunks")?;
    Ok(written)
}

/// Path an upload would be stored at. Only the final path component of
/// `file_name` is used.
fn upload_target(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty() && !n.starts_with('.'))
        .ok_or_else(|| anyhow!("invalid upload file name '{file_name}'"))?;
    let target = dir.join(name);
    if !is_supported(&target) {
        return Err(anyhow!("unsupported file type: {name}"));
    }
    Ok(target)
}

fn write_upload(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    fs::write(target, bytes).with_context(|| format!("failed to write {}", target.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upload_names_are_reduced_to_file_name() {
        let dir = tempdir().unwrap();
        let path = upload_target(dir.path(), "../../etc/manual.txt").unwrap();
        assert_eq!(path, dir.path().join("manual.txt"));
        write_upload(dir.path(), &path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello");
    }

    #[test]
    fn unsupported_uploads_are_refused() {
        let dir = tempdir().unwrap();
        assert!(upload_target(dir.path(), "payload.exe").is_err());
        assert!(upload_target(dir.path(), "").is_err());
        assert!(upload_target(dir.path(), ".hidden.txt").is_err());
    }

    #[test]
    fn uploads_create_the_documents_folder() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("docs");
        let target = upload_target(&nested, "notes.md").unwrap();
        write_upload(&nested, &target, b"# notes").unwrap();
        assert!(target.is_file());
    }
}
