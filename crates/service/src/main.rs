use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use docqa_rag::{
    ingest_upload, AnswerKind, Citation, DocQaConfig, IndexError, IngestReport, QaPipeline,
    Query, ServiceContext,
};

/// Fragments buffered between the generator thread and the response body.
const STREAM_BUFFER: usize = 32;

#[derive(Clone)]
struct AppState {
    ctx: Arc<ServiceContext>,
}

fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config = DocQaConfig::load(None)?;
    let addr: SocketAddr = config.server.bind_addr.parse()?;
    let body_limit = config.server.max_upload_bytes;
    // Backends use blocking HTTP clients, so they are built before the runtime.
    let ctx = Arc::new(ServiceContext::init(config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(ctx.clone(), addr, body_limit));
    drop(runtime);

    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.shutdown(),
        Err(_) => warn!("service context still referenced at exit"),
    }
    served
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(
    ctx: Arc<ServiceContext>,
    addr: SocketAddr,
    body_limit: usize,
) -> Result<(), anyhow::Error> {
    let app = router(AppState { ctx }, body_limit);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/documents", get(handle_documents))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/upload", post(handle_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    doc_id: String,
    #[serde(alias = "question")]
    query: String,
}

impl From<ChatRequest> for Query {
    fn from(body: ChatRequest) -> Self {
        Query::new(body.doc_id, body.query)
    }
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    answer: String,
    kind: AnswerKind,
    citations: Vec<Citation>,
}

#[derive(Debug, Serialize)]
struct DocumentResponse {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    #[serde(flatten)]
    report: IngestReport,
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentResponse>>, AppError> {
    let ctx = state.ctx.clone();
    let entries = task::spawn_blocking(move || ctx.list_documents())
        .await
        .map_err(AppError::internal)??;
    Ok(Json(
        entries
            .into_iter()
            .map(|entry| DocumentResponse {
                id: entry.id,
                name: entry.name,
            })
            .collect(),
    ))
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let query = Query::from(body);
    let ctx = state.ctx.clone();
    let answer = task::spawn_blocking(move || QaPipeline::with_defaults(&ctx).answer(&query))
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::from_pipeline)?;
    Ok(Json(ChatResponse {
        answer: answer.text,
        kind: answer.kind,
        citations: answer.citations,
    }))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let query = Query::from(body);
    let ctx = state.ctx.clone();
    // Retrieval runs before the body starts so its errors keep a proper status.
    let stream =
        task::spawn_blocking(move || QaPipeline::with_defaults(&ctx).answer_stream(&query))
            .await
            .map_err(AppError::internal)?
            .map_err(AppError::from_pipeline)?;

    debug!(
        kind = ?stream.kind(),
        citations = stream.citations().len(),
        "streaming answer"
    );
    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
    task::spawn_blocking(move || {
        for fragment in stream {
            if tx.blocking_send(fragment).is_err() {
                debug!("client went away, dropping the rest of the answer");
                break;
            }
        }
    });
    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|fragment| (Ok::<_, Infallible>(fragment), rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let upload = extract_file(&mut multipart).await?;
    let ctx = state.ctx.clone();
    let report = task::spawn_blocking(move || {
        ingest_upload(&ctx, &upload.filename, &upload.data)
            .map_err(|err| AppError::bad_request(format!("{err:#}")))
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(UploadResponse { report }))
}

struct UploadedFile {
    data: Vec<u8>,
    filename: String,
}

async fn extract_file(multipart: &mut Multipart) -> Result<UploadedFile, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(AppError::bad_request)?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .map(|s| s.to_string())
                .ok_or_else(|| AppError::bad_request("file field has no file name"))?;
            let data = field.bytes().await.map_err(AppError::bad_request)?;
            return Ok(UploadedFile {
                data: data.to_vec(),
                filename,
            });
        }
    }
    Err(AppError::bad_request("missing file"))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }

    /// Invalid filter values are the caller's fault; everything else is ours.
    fn from_pipeline(err: anyhow::Error) -> Self {
        match err.downcast_ref::<IndexError>() {
            Some(IndexError::InvalidFilter(msg)) => Self::BadRequest(msg.clone()),
            _ => Self::Internal(err),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::BadRequest(msg) => (status, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %format!("{err:#}"));
                (status, "internal error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_rag::Filter;

    #[test]
    fn empty_doc_id_maps_to_bad_request() {
        let err = Filter::doc_id("").map_err(anyhow::Error::from).unwrap_err();
        let app_err = AppError::from_pipeline(err.context("retrieval failed"));
        assert_eq!(app_err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_pipeline_errors_are_internal() {
        let app_err = AppError::from_pipeline(anyhow::anyhow!("embedding backend down"));
        assert_eq!(app_err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn chat_request_accepts_question_alias() {
        let body: ChatRequest =
            serde_json::from_str(r#"{"doc_id": "manual.pdf", "question": "torque?"}"#).unwrap();
        let query = Query::from(body);
        assert_eq!(query.doc_id, "manual.pdf");
        assert_eq!(query.text, "torque?");
    }

    #[test]
    fn upload_response_is_flat() {
        let report = IngestReport {
            status: docqa_rag::IngestStatus::Exists,
            doc_id: "manual.pdf".to_string(),
            doc_name: "manual.pdf".to_string(),
            chunks: 0,
            message: "document already indexed".to_string(),
        };
        let value = serde_json::to_value(UploadResponse { report }).unwrap();
        assert_eq!(value["status"], "exists");
        assert_eq!(value["doc_id"], "manual.pdf");
        assert_eq!(value["chunks"], 0);
    }
}
