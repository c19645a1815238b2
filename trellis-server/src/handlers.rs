//! Request routing and per-operation handlers
//!
//! Push request bodies and checkout responses are streamed record by
//! record; large file contents never sit in memory whole. Other bodies are
//! small bincode values, buffered up to the configured body limit.

use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info};
use trellis_core::object::BinaryCodec;
use trellis_core::{
    CheckoutPathSet, CheckoutStats, ClientCheckoutSpec, Datastore, ObjectReader, ObjectType,
    ObjectWriter, PushQuery,
};

use crate::query::parse_query;

/// Header naming the pushing user.
pub const USER_HEADER: &str = "x-trellis-user";

/// Header carrying the error message on failed requests.
pub const ERROR_HEADER: &str = "x-trellis-error";

pub const ERROR_KIND_HEADER: &str = "x-trellis-error-kind";

const BINARY: &str = "application/octet-stream";

/// Buffer between the checkout writer task and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request body is larger than {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] trellis_core::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::MissingParam(_) | ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Core(trellis_core::Error::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) | ServerError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServerError::MissingParam(_) | ServerError::InvalidRequest(_) => "bad_request",
            ServerError::NotFound(_) => "not_found",
            ServerError::PayloadTooLarge(_) => "payload_too_large",
            ServerError::Internal(_) => "internal",
            ServerError::Core(e) => e.kind(),
        }
    }
}

type HandlerResult = Result<Response<ResponseBody>, ServerError>;

struct Params(HashMap<String, String>);

impl Params {
    fn required(&self, name: &'static str) -> Result<&str, ServerError> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or(ServerError::MissingParam(name))
    }

    fn commit_id(&self, name: &'static str) -> Result<u64, ServerError> {
        let raw = self.required(name)?;
        raw.parse()
            .map_err(|_| ServerError::InvalidRequest(format!("{} is not a commit id: {}", name, raw)))
    }

    fn paths(&self) -> Result<CheckoutPathSet, ServerError> {
        CheckoutPathSet::parse(self.required("paths")?)
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))
    }
}

pub struct TrellisHandler {
    datastore: Datastore,
    max_body_size: usize,
}

impl TrellisHandler {
    pub fn new(datastore: Datastore) -> Self {
        let max_body_size = datastore.config().max_body_size;
        Self {
            datastore,
            max_body_size,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Handle one request. Failures become error responses, never `Err`.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();
        debug!("Request: {} {}", method, uri);

        match self.route(req).await {
            Ok(response) => {
                info!("{} {} -> {}", method, uri.path(), response.status());
                response
            }
            Err(e) => {
                error!(kind = e.kind(), "{} {} failed: {}", method, uri.path(), e);
                error_response(&e)
            }
        }
    }

    async fn route<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let path = req.uri().path().to_string();
        if path == "/health" {
            return Ok(json_ok(&serde_json::json!({ "status": "ok" })));
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let [org, repo, op] = parts.as_slice() else {
            return Err(ServerError::NotFound(format!("No route for {}", path)));
        };
        let (org, repo, op) = (org.to_string(), repo.to_string(), op.to_string());
        let params = Params(parse_query(req.uri().query().unwrap_or("")));
        let user = req
            .headers()
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match op.as_str() {
            "checkoutQuery" => self.checkout_query(&org, &repo, &params).await,
            "checkout" => {
                let body = self.read_body(req.into_body()).await?;
                self.checkout(org, repo, &params, &body).await
            }
            "pushQuery" => {
                let body = self.read_body(req.into_body()).await?;
                self.push_query(&org, &repo, &body).await
            }
            "push" => {
                let user = user.ok_or_else(|| {
                    ServerError::InvalidRequest(format!("Missing {} header", USER_HEADER))
                })?;
                self.push(&org, &repo, &user, req.into_body()).await
            }
            "getBranch" => self.get_branch(&org, &repo, &params).await,
            "log" => self.log(&org, &repo, &params).await,
            "merge" => self.merge(&org, &repo, &params).await,
            "createRepo" => {
                let entry = self.datastore.create_repo(&org, &repo).await?;
                Ok(binary_ok(entry.to_bytes().map_err(trellis_core::Error::from)?))
            }
            _ => Err(ServerError::NotFound(format!("Unknown operation: {}", op))),
        }
    }

    async fn read_body<B>(&self, body: B) -> Result<Bytes, ServerError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        match Limited::new(body, self.max_body_size).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ServerError::PayloadTooLarge(self.max_body_size))
            }
            Err(e) => Err(ServerError::InvalidRequest(format!("Failed to read body: {}", e))),
        }
    }

    async fn checkout_query(&self, org: &str, repo: &str, params: &Params) -> HandlerResult {
        let branch = params.required("branchName")?;
        let commit_id = params.commit_id("commitId")?;
        let paths = params.paths()?;
        let spec = self
            .datastore
            .compute_checkout(org, repo, branch, commit_id, &paths)
            .await?;
        Ok(binary_ok(spec.to_bytes().map_err(trellis_core::Error::from)?))
    }

    async fn checkout(&self, org: String, repo: String, params: &Params, body: &[u8]) -> HandlerResult {
        let branch = params.required("branchName")?.to_string();
        let commit_id = params.commit_id("commitId")?;
        let paths = params.paths()?;
        let client = decode::<ClientCheckoutSpec>(body)?;

        let datastore = self.datastore.clone();
        let (sink, source) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(async move {
            let mut out = ObjectWriter::new(sink);
            let stats = datastore
                .do_checkout(&org, &repo, &branch, commit_id, &paths, &client, &mut out)
                .await?;
            out.flush().await?;
            debug!(large_bytes = stats.large_bytes_sent, "checkout stream finished");
            Ok::<_, trellis_core::Error>(stats)
        });
        streamed_response(source, task).await
    }

    async fn push_query(&self, org: &str, repo: &str, body: &[u8]) -> HandlerResult {
        let query = decode::<PushQuery>(body)?;
        if query.org != org || query.repo != repo {
            return Err(ServerError::InvalidRequest(format!(
                "Push query for {}/{} sent to {}/{}",
                query.org, query.repo, org, repo
            )));
        }
        let response = self.datastore.handle_push_query(&query).await?;
        Ok(binary_ok(response.to_bytes().map_err(trellis_core::Error::from)?))
    }

    /// Feed the request body straight into push ingestion. Only individual
    /// records are size-limited; large file contents stream to the blob store.
    async fn push<B>(&self, org: &str, repo: &str, user: &str, body: B) -> HandlerResult
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let chunks = BodyStream::new(body)
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
            .map_err(std::io::Error::other);
        let mut reader = ObjectReader::new(StreamReader::new(Box::pin(chunks)));
        let outcome = self.datastore.push_to(org, repo, user, &mut reader).await?;
        Ok(binary_ok(outcome.to_bytes().map_err(trellis_core::Error::from)?))
    }

    async fn get_branch(&self, org: &str, repo: &str, params: &Params) -> HandlerResult {
        let name = params.required("branchName")?;
        match self.datastore.get_branch(org, repo, name).await? {
            Some(branch) => Ok(binary_ok(branch.to_bytes().map_err(trellis_core::Error::from)?)),
            None => Err(ServerError::NotFound(format!("Branch {} not found", name))),
        }
    }

    async fn log(&self, org: &str, repo: &str, params: &Params) -> HandlerResult {
        let branch = params.required("branchName")?;
        let path = params.required("path")?;
        let commit_id = params.commit_id("commitId")?;
        let commits = self.datastore.log(org, repo, branch, path, commit_id).await?;
        let mut out = ObjectWriter::new(Vec::new());
        for commit in &commits {
            out.write_object(ObjectType::Commit, &commit.commit_id.to_string(), commit)
                .await?;
        }
        Ok(binary_ok(out.into_inner()))
    }

    async fn merge(&self, org: &str, repo: &str, params: &Params) -> HandlerResult {
        let branch = params.required("branchName")?;
        let head = params.commit_id("headCommitId")?;
        let result = self.datastore.merge(org, repo, branch, head).await?;
        let mut out = ObjectWriter::new(Vec::new());
        out.write_object(ObjectType::MergeResult, branch, &result).await?;
        Ok(binary_ok(out.into_inner()))
    }
}

fn decode<T: BinaryCodec>(body: &[u8]) -> Result<T, ServerError> {
    T::from_bytes(body).map_err(|e| ServerError::InvalidRequest(format!("Malformed body: {}", e)))
}

/// Turn the read half of a checkout pipe into a response. Errors raised
/// before the first byte become ordinary error responses; later ones abort
/// the body so the client never mistakes a cut-off stream for a whole one.
async fn streamed_response(
    mut source: DuplexStream,
    task: JoinHandle<trellis_core::Result<CheckoutStats>>,
) -> HandlerResult {
    let mut first = vec![0u8; PIPE_CAPACITY];
    let n = source
        .read(&mut first)
        .await
        .map_err(trellis_core::Error::from)?;
    if n == 0 {
        join_checkout(task).await?;
        return Ok(binary_ok(Vec::new()));
    }
    first.truncate(n);

    let tail = stream::once(join_checkout(task)).filter_map(|done| async move {
        done.err()
            .map(|e| Err::<Bytes, _>(std::io::Error::other(e.to_string())))
    });
    let frames = stream::once(async move { Ok(Bytes::from(first)) })
        .chain(ReaderStream::with_capacity(source, PIPE_CAPACITY))
        .chain(tail)
        .map_ok(Frame::data);

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(BINARY));
    Ok(response)
}

async fn join_checkout(
    task: JoinHandle<trellis_core::Result<CheckoutStats>>,
) -> Result<CheckoutStats, ServerError> {
    match task.await {
        Ok(result) => Ok(result?),
        Err(e) => Err(ServerError::Internal(format!("Checkout task failed: {}", e))),
    }
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn binary_ok(body: Vec<u8>) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(BINARY));
    response
}

fn json_ok<T: serde::Serialize>(data: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(data).unwrap_or_default();
    let mut response = Response::new(full(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(e: &ServerError) -> Response<ResponseBody> {
    let message = e.to_string();
    let mut response = Response::new(full(message.clone()));
    *response.status_mut() = e.status();
    let printable: String = message
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&printable) {
        headers.insert(ERROR_HEADER, value);
    }
    headers.insert(ERROR_KIND_HEADER, HeaderValue::from_static(e.kind()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
