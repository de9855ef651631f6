//! The sender's TLS transfer server (C5): `/info`, `/prepare-upload`,
//! `/download`, a per-IP sliding-window rate limiter, and the
//! connected/completion barriers the orchestrator awaits on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::auth;
use crate::catalog::FileCatalog;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{
    CliAuth, DeviceType, DownloadQuery, FileDescriptor, InfoResponse, PrepareUploadRequest,
    PrepareUploadResponse, PROTOCOL_VERSION,
};

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX: usize = 60;
const AUTH_WINDOW_MS: i64 = 5 * 60 * 1000;
const COMPLETION_GRACE: Duration = Duration::from_millis(500);

struct Session {
    id: Uuid,
}

struct Barriers {
    connected_tx: Option<oneshot::Sender<()>>,
    completion_tx: Option<oneshot::Sender<()>>,
}

struct ServerState {
    alias: String,
    fingerprint: String,
    canonical_phrase: String,
    catalog: FileCatalog,
    session: Mutex<Option<Session>>,
    delivered: Mutex<HashSet<Uuid>>,
    rate_limits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    barriers: Mutex<Barriers>,
}

/// Owns the running TLS server and the barriers the orchestrator waits on.
pub struct TransferServer {
    port: u16,
    handle: Handle,
    state: Arc<ServerState>,
    connected_rx: Option<oneshot::Receiver<()>>,
    completion_rx: Option<oneshot::Receiver<()>>,
}

impl TransferServer {
    /// Binds `port` (0 lets the OS choose), serves the routes below over
    /// TLS using `identity`, and returns once the listener is bound.
    #[tracing::instrument(skip(identity, canonical_phrase, catalog))]
    pub async fn start(
        identity: &Identity,
        alias: String,
        canonical_phrase: String,
        catalog: FileCatalog,
        port: u16,
    ) -> Result<Self> {
        let (connected_tx, connected_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        let state = Arc::new(ServerState {
            alias,
            fingerprint: identity.fingerprint_hex(),
            canonical_phrase,
            catalog,
            session: Mutex::new(None),
            delivered: Mutex::new(HashSet::new()),
            rate_limits: Mutex::new(HashMap::new()),
            barriers: Mutex::new(Barriers {
                connected_tx: Some(connected_tx),
                completion_tx: Some(completion_tx),
            }),
        });

        let app = Router::new()
            .route("/api/localsend/v2/info", get(handle_info))
            .route("/api/localsend/v2/prepare-upload", post(handle_prepare_upload))
            .route("/api/localsend/v2/download", get(handle_download))
            .fallback(handle_not_found)
            .with_state(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();

        let tls_config = RustlsConfig::from_pem(
            identity.cert_pem.clone().into_bytes(),
            identity.key_pem.clone().into_bytes(),
        )
        .await
        .map_err(|e| Error::Tls(format!("failed to configure server TLS: {e}")))?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let handle = Handle::new();
        let serve_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(addr, tls_config)
                .handle(serve_handle)
                .serve(app)
                .await
            {
                tracing::warn!(error = %e, "transfer server exited with error");
            }
        });

        let bound_addr = handle
            .listening()
            .await
            .ok_or_else(|| Error::Transfer("transfer server failed to bind".to_string()))?;

        tracing::info!(port = bound_addr.port(), "transfer server listening");

        Ok(Self {
            port: bound_addr.port(),
            handle,
            state,
            connected_rx: Some(connected_rx),
            completion_rx: Some(completion_rx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn file_count(&self) -> usize {
        self.state.catalog.len()
    }

    /// Waits for the first successful `/prepare-upload` or times out.
    pub async fn await_connected(&mut self, timeout: Duration) -> Result<()> {
        let rx = self
            .connected_rx
            .take()
            .ok_or_else(|| Error::Protocol("connected barrier already awaited".to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Protocol("connected barrier dropped".to_string())),
            Err(_) => Err(Error::Discovery(
                "timed out waiting for a receiver to connect".to_string(),
            )),
        }
    }

    /// Waits for the completion barrier (all files delivered plus grace period).
    pub async fn await_completion(&mut self, timeout: Duration) -> Result<()> {
        let rx = self
            .completion_rx
            .take()
            .ok_or_else(|| Error::Protocol("completion barrier already awaited".to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Protocol("completion barrier dropped".to_string())),
            Err(_) => Err(Error::Transfer(
                "timed out waiting for the transfer to complete".to_string(),
            )),
        }
    }

    /// Gracefully stops accepting new connections and lets in-flight ones finish.
    pub async fn shutdown(self) {
        self.handle.graceful_shutdown(Some(Duration::from_secs(2)));
    }
}

fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Drops expired entries from `ip`'s bucket and admits the request if the
/// remaining count is under the limit, recording the admission.
async fn check_rate_limit(state: &ServerState, ip: IpAddr) -> bool {
    let mut limits = state.rate_limits.lock().await;
    let now = Instant::now();
    let bucket = limits.entry(ip).or_default();
    while let Some(oldest) = bucket.front() {
        if now.duration_since(*oldest) > RATE_LIMIT_WINDOW {
            bucket.pop_front();
        } else {
            break;
        }
    }
    if bucket.len() >= RATE_LIMIT_MAX {
        return false;
    }
    bucket.push_back(now);
    true
}

async fn mark_delivered(state: &Arc<ServerState>, file_id: Uuid) {
    let should_schedule = {
        let mut delivered = state.delivered.lock().await;
        delivered.insert(file_id);
        delivered.len() == state.catalog.len()
    };
    if should_schedule {
        schedule_completion(state.clone());
    }
}

fn schedule_completion(state: Arc<ServerState>) {
    tokio::spawn(async move {
        tokio::time::sleep(COMPLETION_GRACE).await;
        let mut barriers = state.barriers.lock().await;
        if let Some(tx) = barriers.completion_tx.take() {
            let _ = tx.send(());
            tracing::info!("transfer completion barrier fired");
        }
    });
}

async fn handle_info(State(state): State<Arc<ServerState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        alias: state.alias.clone(),
        version: PROTOCOL_VERSION.to_string(),
        device_model: "headless".to_string(),
        device_type: DeviceType::Headless,
        fingerprint: state.fingerprint.clone(),
        download: true,
    })
}

#[tracing::instrument(skip(state, request))]
async fn handle_prepare_upload(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
    Json(request): Json<PrepareUploadRequest>,
) -> Response {
    if !check_rate_limit(&state, addr.ip()).await {
        tracing::warn!(peer = %addr, "rate limit exceeded on prepare-upload");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if let Err(response) = verify_cli_auth(&state, request.cli_auth.as_ref()) {
        return response;
    }

    let mut session_guard = state.session.lock().await;
    let (session_id, first_connection) = match session_guard.as_ref() {
        Some(existing) => (existing.id, false),
        None => {
            let id = Uuid::new_v4();
            *session_guard = Some(Session { id });
            (id, true)
        }
    };
    drop(session_guard);

    if first_connection {
        let mut barriers = state.barriers.lock().await;
        if let Some(tx) = barriers.connected_tx.take() {
            let _ = tx.send(());
        }
        tracing::info!(peer = %addr, alias = %request.info.alias, "receiver connected");
    }

    Json(PrepareUploadResponse {
        session_id,
        files: state.catalog.descriptors(),
    })
    .into_response()
}

fn verify_cli_auth(
    state: &ServerState,
    cli_auth: Option<&CliAuth>,
) -> std::result::Result<(), Response> {
    let cli_auth = cli_auth
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing cliAuth").into_response())?;

    let timestamp: i64 = cli_auth
        .timestamp
        .parse()
        .map_err(|_| (StatusCode::UNAUTHORIZED, "malformed timestamp").into_response())?;

    if (unix_millis_now() - timestamp).abs() > AUTH_WINDOW_MS {
        return Err((StatusCode::UNAUTHORIZED, "authentication expired").into_response());
    }

    let expected = auth::compute_proof(&state.canonical_phrase, &cli_auth.timestamp, &state.fingerprint);
    if !auth::constant_time_eq_str(&expected, &cli_auth.proof) {
        tracing::warn!("prepare-upload proof mismatch");
        return Err(StatusCode::FORBIDDEN.into_response());
    }

    Ok(())
}

async fn handle_download(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    if !check_rate_limit(&state, addr.ip()).await {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let session_matches = {
        let session = state.session.lock().await;
        session.as_ref().map(|s| s.id == query.session_id).unwrap_or(false)
    };
    if !session_matches {
        return StatusCode::FORBIDDEN.into_response();
    }

    let descriptor: FileDescriptor = match state.catalog.get(&query.file_id) {
        Some(d) => d.clone(),
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    let file = match state.catalog.open(&query.file_id).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, file_id = %query.file_id, "failed to open file for download");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let byte_stream = tokio_util::io::ReaderStream::new(file);
    let file_id = query.file_id;
    let completion_state = state.clone();
    let stream = CompletionStream::new(byte_stream, move || {
        let state = completion_state.clone();
        tokio::spawn(async move {
            mark_delivered(&state, file_id).await;
        });
    });

    let body = Body::from_stream(stream);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", descriptor.name),
        )
        .header(header::CONTENT_LENGTH, descriptor.size)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Wraps a byte stream and invokes a callback exactly once, when the
/// underlying stream first reports end-of-stream, so the completion barrier
/// fires only after a download's response body has fully closed.
struct CompletionStream<S, F> {
    inner: S,
    on_complete: Option<F>,
}

impl<S, F> CompletionStream<S, F> {
    fn new(inner: S, on_complete: F) -> Self {
        Self {
            inner,
            on_complete: Some(on_complete),
        }
    }
}

impl<S, F> Stream for CompletionStream<S, F>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    F: FnOnce() + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = poll {
            if let Some(callback) = self.on_complete.take() {
                callback();
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_admits_up_to_the_limit_then_rejects() {
        let state = test_state();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(check_rate_limit(&state, ip).await);
        }
        assert!(!check_rate_limit(&state, ip).await);
    }

    #[tokio::test]
    async fn rate_limiter_tracks_ips_independently() {
        let state = test_state();
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(check_rate_limit(&state, a).await);
        }
        assert!(!check_rate_limit(&state, a).await);
        assert!(check_rate_limit(&state, b).await);
    }

    #[test]
    fn verify_cli_auth_accepts_valid_proof() {
        let state = test_state_sync();
        let timestamp = unix_millis_now().to_string();
        let proof = auth::compute_proof(&state.canonical_phrase, &timestamp, &state.fingerprint);
        let cli_auth = CliAuth { timestamp, proof };
        assert!(verify_cli_auth(&state, Some(&cli_auth)).is_ok());
    }

    #[test]
    fn verify_cli_auth_rejects_stale_timestamp() {
        let state = test_state_sync();
        let stale = (unix_millis_now() - AUTH_WINDOW_MS - 1000).to_string();
        let proof = auth::compute_proof(&state.canonical_phrase, &stale, &state.fingerprint);
        let cli_auth = CliAuth { timestamp: stale, proof };
        assert!(verify_cli_auth(&state, Some(&cli_auth)).is_err());
    }

    #[test]
    fn verify_cli_auth_rejects_wrong_proof() {
        let state = test_state_sync();
        let timestamp = unix_millis_now().to_string();
        let cli_auth = CliAuth {
            timestamp,
            proof: "0".repeat(64),
        };
        assert!(verify_cli_auth(&state, Some(&cli_auth)).is_err());
    }

    #[test]
    fn verify_cli_auth_rejects_missing_auth() {
        let state = test_state_sync();
        assert!(verify_cli_auth(&state, None).is_err());
    }

    fn test_state() -> ServerState {
        test_state_sync()
    }

    fn test_state_sync() -> ServerState {
        ServerState {
            alias: "tester".to_string(),
            fingerprint: "ab".repeat(32),
            canonical_phrase: "swift-ocean".to_string(),
            catalog: FileCatalog::default(),
            session: Mutex::new(None),
            delivered: Mutex::new(HashSet::new()),
            rate_limits: Mutex::new(HashMap::new()),
            barriers: Mutex::new(Barriers {
                connected_tx: None,
                completion_tx: None,
            }),
        }
    }
}
