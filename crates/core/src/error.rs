use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pdf support not enabled: {0:?}")]
    PdfSupportDisabled(PathBuf),
    #[error("pdf extraction failed for {path:?}: {message}")]
    PdfExtract { path: PathBuf, message: String },
    #[error("unsupported input format: {0:?}")]
    UnsupportedInput(PathBuf),
    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),
    #[error("embedding error: {0}")]
    Embedding(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
