use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use glob::glob;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use docqa_core::{is_supported, list_documents};
use docqa_rag::config::DEFAULT_CONFIG_FILE;
use docqa_rag::{
    ingest_file, Answer, AnswerStream, Citation, DocQaConfig, Filter, IngestStatus, OutputMode,
    PayloadField, PipelineOptions, QaPipeline, Query, Response, ServiceContext, SqliteIndex,
    VectorIndex,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const VERSION_LONG: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (formats: ",
    env!("DOCQA_FEATURES"),
    ")"
);

#[derive(Parser, Debug)]
#[command(
    name = "docqa",
    version = VERSION,
    long_version = VERSION_LONG,
    about = "Grounded question answering over local documents"
)]
struct Cli {
    /// Config file; defaults to $DOCQA_CONFIG or ./docqa.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and create the documents folder and index.
    Init {
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Index files, directories or glob patterns. Defaults to the documents folder.
    Ingest {
        inputs: Vec<PathBuf>,
        /// Print one JSON report per file.
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// List documents in the documents folder with their indexed chunk counts.
    List,
    /// Ask a question about one document.
    Ask {
        doc_id: String,
        question: String,
        #[arg(long, action = ArgAction::SetTrue)]
        stream: bool,
        #[arg(long = "no-rerank", action = ArgAction::SetTrue)]
        no_rerank: bool,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
        #[arg(long)]
        candidates: Option<usize>,
        /// Print the chunks the answer was grounded on.
        #[arg(long, action = ArgAction::SetTrue)]
        sources: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            run_init(&path, force)?;
        }
        Commands::Ingest { inputs, json } => {
            let config = DocQaConfig::load(cli.config.as_deref())?;
            let inputs = if inputs.is_empty() {
                vec![config.documents.dir.clone()]
            } else {
                inputs
            };
            let files = gather_input_files(&inputs)?;
            if files.is_empty() {
                bail!("no supported documents found");
            }
            let ctx = ServiceContext::init(config)?;
            let failed = run_ingest(&ctx, &files, json)?;
            ctx.shutdown();
            if failed > 0 {
                bail!("{failed} of {} documents failed to ingest", files.len());
            }
        }
        Commands::List => {
            let config = DocQaConfig::load(cli.config.as_deref())?;
            run_list(&config)?;
        }
        Commands::Ask {
            doc_id,
            question,
            stream,
            no_rerank,
            top_k,
            candidates,
            sources,
        } => {
            let config = DocQaConfig::load(cli.config.as_deref())?;
            let ctx = ServiceContext::init(config)?;
            let mut options = PipelineOptions::from_config(&ctx.config().retrieval);
            options.rerank = !no_rerank && ctx.reranker().is_some();
            if let Some(k) = top_k {
                options.top_k = k;
                options.candidates = options.candidates.max(k);
            }
            if let Some(c) = candidates {
                options.candidates = c.max(options.top_k);
            }
            if stream {
                options.output = OutputMode::Streaming;
            }
            debug!(?options, "ask options");
            let query = Query::new(doc_id, question);
            match QaPipeline::new(&ctx, options).respond(&query)? {
                Response::Complete(answer) => print_answer(&answer, sources),
                Response::Stream(stream) => print_stream(stream, sources)?,
            }
            ctx.shutdown();
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let config = DocQaConfig::default();
    fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    fs::create_dir_all(&config.documents.dir)
        .with_context(|| format!("failed to create {}", config.documents.dir.display()))?;
    let index = SqliteIndex::open(&config.index.path)?;
    index.create_collection(
        &config.index.collection,
        config.embedding.dimensions,
        config.index.distance,
    )?;
    index.ensure_payload_index(&config.index.collection, PayloadField::DocId)?;
    println!("wrote {}", path.display());
    println!("documents folder: {}", config.documents.dir.display());
    println!("index: {}", index.describe());
    Ok(())
}

/// Returns the number of failed files.
fn run_ingest(ctx: &ServiceContext, files: &[PathBuf], json: bool) -> Result<usize> {
    let mut failed = 0;
    for path in files {
        let report = ingest_file(ctx, path);
        if report.status == IngestStatus::Failure {
            failed += 1;
        }
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!(
                "{:<8} {} ({} chunks) {}",
                status_label(report.status),
                report.doc_id,
                report.chunks,
                report.message
            );
        }
    }
    Ok(failed)
}

fn status_label(status: IngestStatus) -> &'static str {
    match status {
        IngestStatus::Success => "indexed",
        IngestStatus::Exists => "exists",
        IngestStatus::Failure => "failed",
    }
}

fn run_list(config: &DocQaConfig) -> Result<()> {
    let entries = list_documents(&config.documents.dir)?;
    if entries.is_empty() {
        println!("no documents in {}", config.documents.dir.display());
        return Ok(());
    }
    // Listing must not create an index as a side effect.
    let index = if config.index.path.exists() {
        Some(SqliteIndex::open(&config.index.path)?)
    } else {
        None
    };
    for entry in entries {
        let chunks = index.as_ref().and_then(|index| {
            let filter = Filter::doc_id(&entry.id).ok()?;
            index
                .count(&config.index.collection, Some(&filter))
                .map_err(|err| warn!(doc_id = %entry.id, error = %err, "count failed"))
                .ok()
        });
        match chunks {
            Some(n) if n > 0 => println!("{}\t{}\t{n} chunks", entry.id, entry.name),
            _ => println!("{}\t{}\tnot indexed", entry.id, entry.name),
        }
    }
    Ok(())
}

fn print_answer(answer: &Answer, sources: bool) {
    println!("{}", answer.text);
    if sources {
        print_citations(&answer.citations);
    }
}

fn print_stream(mut stream: AnswerStream, sources: bool) -> Result<()> {
    let citations = stream.citations().to_vec();
    let mut stdout = io::stdout().lock();
    for fragment in stream.by_ref() {
        stdout.write_all(fragment.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    drop(stdout);
    if sources {
        print_citations(&citations);
    }
    Ok(())
}

fn print_citations(citations: &[Citation]) {
    if citations.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for citation in citations {
        let pages = if citation.page_start == citation.page_end {
            format!("page {}", citation.page_start)
        } else {
            format!("pages {}-{}", citation.page_start, citation.page_end)
        };
        println!(
            "  [{pages}] score {:.3}: {}",
            citation.score,
            short_preview(&citation.text, 80)
        );
    }
}

fn short_preview(text: &str, limit: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= limit {
        return flat;
    }
    let mut out: String = flat.chars().take(limit).collect();
    out.push_str("...");
    out
}

/// Expands files, directories and glob patterns into supported documents,
/// sorted and without duplicates.
fn gather_input_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let input_str = input.to_string_lossy();
        if input_str.contains('*') || input_str.contains('?') || input_str.contains('[') {
            for entry in glob(&input_str)? {
                let path = entry?;
                if path.is_file() && is_supported(&path) {
                    files.push(path);
                }
            }
            continue;
        }
        let meta = fs::metadata(input)
            .with_context(|| format!("failed to inspect {}", input.display()))?;
        if meta.is_dir() {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_supported(e.path()))
            {
                files.push(entry.path().to_path_buf());
            }
        } else if meta.is_file() {
            if !is_supported(input) {
                warn!(path = %input.display(), "unsupported file type, skipping");
                continue;
            }
            files.push(input.clone());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ask_flags_parse() {
        let cli = Cli::try_parse_from([
            "docqa",
            "ask",
            "manual.pdf",
            "what torque?",
            "--stream",
            "--no-rerank",
            "--top-k",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Ask {
                doc_id,
                stream,
                no_rerank,
                top_k,
                candidates,
                ..
            } => {
                assert_eq!(doc_id, "manual.pdf");
                assert!(stream && no_rerank);
                assert_eq!(top_k, Some(3));
                assert_eq!(candidates, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn directories_expand_to_supported_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.md"), "# b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("notes.docx"), "x").unwrap();
        let files = gather_input_files(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);
    }

    #[test]
    fn overlapping_inputs_are_listed_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.md"), "# b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let inputs = vec![
            dir.path().join("b.md"),
            dir.path().to_path_buf(),
            dir.path().join("*.txt"),
        ];
        let files = gather_input_files(&inputs).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.txt"), dir.path().join("b.md")]
        );
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(gather_input_files(&[dir.path().join("nope.pdf")]).is_err());
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docqa.toml");
        fs::write(&path, "").unwrap();
        assert!(run_init(&path, false).is_err());
    }

    #[test]
    fn preview_is_flattened_and_capped() {
        assert_eq!(short_preview("a\n b", 10), "a b");
        assert_eq!(short_preview("abcdef", 3), "abc...");
    }
}
