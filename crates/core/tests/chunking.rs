use std::fs;

use docqa_core::{
    ChunkConfig, ChunkPolicy, Chunker, DocIdStrategy, DocumentRecord, FileExtractor,
    HashEmbedder, TextExtractor,
};
use tempfile::tempdir;

fn manual_pages() -> String {
    [
        "Section one. The reservoir holds four hundred litres of drinking water.",
        "Section two. Rotate stored water every six months to keep it fresh.",
        "",
        "Section four. Seed packets should be kept dry and below fifteen degrees.",
        "Section five. Label every packet with the harvest year.",
    ]
    .join("\u{c}")
}

#[test]
fn extracted_text_file_chunks_within_page_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("prep manual.txt");
    fs::write(&path, manual_pages()).unwrap();

    let pages = FileExtractor.extract(&path).unwrap();
    assert_eq!(pages.len(), 5);

    let doc = DocumentRecord::from_path(&path, DocIdStrategy::Filename);
    let chunks = Chunker::new(ChunkConfig::default())
        .chunk_document(&doc, &pages, &HashEmbedder::default())
        .unwrap();

    let bounds: Vec<_> = chunks.iter().map(|c| (c.page_start, c.page_end)).collect();
    assert_eq!(bounds, vec![(1, 2), (4, 4), (5, 5)]);
    for chunk in &chunks {
        assert_eq!(chunk.doc_id, "prep_manual.txt");
        assert_eq!(chunk.doc_name, "prep manual.txt");
        assert!(chunk.page_start <= chunk.page_end);
        assert!(chunk.page_end as usize <= pages.len());
        assert!(!chunk.covers_page(3));
    }
}

#[test]
fn semantic_policy_never_spans_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("prep.txt");
    fs::write(&path, manual_pages()).unwrap();

    let pages = FileExtractor.extract(&path).unwrap();
    let doc = DocumentRecord::from_path(&path, DocIdStrategy::Filename);
    let config = ChunkConfig {
        policy: ChunkPolicy::Semantic,
        ..Default::default()
    };
    let chunks = Chunker::new(config)
        .chunk_document(&doc, &pages, &HashEmbedder::default())
        .unwrap();

    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.page_start == c.page_end));
    assert!(chunks.iter().all(|c| c.page_start != 3));
    let mut seen = std::collections::HashSet::new();
    assert!(chunks.iter().all(|c| seen.insert(c.chunk_id.clone())));
}
