//! The HTTP transport for the distribution protocol.
//!
//! Routes carry `wire::dist::v1` messages as MessagePack bodies; blob
//! routes carry raw (optionally zstd) bytes. Both roles also expose their
//! local content store under `/api/v1/cas/{hash}` so peers can copy content
//! directly (the client side lives in [`crate::cas::remote::HttpPeer`]).

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use color_eyre::{Result, eyre::Context};
use serde::{Serialize, de::DeserializeOwned};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use wire::{
    ContentHash, ContentType,
    dist::v1::{
        Attach, AttachCompleted, ExecutePips, Exit, Heartbeat, Hello, HelloResponse,
        ReportExecutionLog, ReportPipResults, decode, encode,
    },
};

use crate::{
    cas::{
        directory::GlobalDirectory,
        local::LocalCas,
        remote::{RemoteStore, compress, decompress},
    },
    exec::IpcRelay,
    sandbox::Monitor,
};

use super::{orchestrator::Orchestrator, worker::WorkerService};

/// Render a message as a MessagePack response.
fn msgpack<T: Serialize>(value: &T) -> Response {
    match encode(value) {
        Ok(body) => (
            StatusCode::OK,
            [(ContentType::HEADER, ContentType::MsgPack.value())],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(?err, "response encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Parse a MessagePack request body.
fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    decode(body).map_err(|err| {
        warn!(?err, "undecodable request body");
        StatusCode::BAD_REQUEST.into_response()
    })
}

/// Bind an ephemeral local port, returning its address and the listener to
/// pass to [`serve_on`]. Binding before constructing a service lets the
/// service know its own address.
pub async fn bind_ephemeral() -> Result<(SocketAddr, tokio::net::TcpListener)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind server listener")?;
    let addr = listener.local_addr().context("read local addr")?;
    Ok((addr, listener))
}

/// Serve the router on an already-bound listener.
pub fn serve_on(
    listener: tokio::net::TcpListener,
    router: Router,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!(?err, "server exited");
        }
    })
}

/// Bind an ephemeral local port and serve the router on it.
pub async fn spawn_server(router: Router) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let (addr, listener) = bind_ephemeral().await?;
    let handle = serve_on(listener, router);
    info!(%addr, "server listening");
    Ok((addr, handle))
}

// ── Content store routes ────────────────────────────────────────────────

/// Routes serving a local content store to peers.
pub fn cas_router(cas: LocalCas) -> Router {
    Router::new()
        .route(
            "/api/v1/cas/{hash}",
            get(cas_read).head(cas_head).put(cas_write),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(cas)
}

#[instrument(skip(cas, headers))]
async fn cas_read(
    State(cas): State<LocalCas>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Ok(hash) = ContentHash::parse(&hash) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let content = match cas.read_buffered(&hash).await {
        Ok(Some(content)) => content,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(?err, "cas read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let want_compressed = headers
        .get(ContentType::ACCEPT)
        .is_some_and(|accept| accept == ContentType::BytesZstd);
    if want_compressed {
        match compress(&content).await {
            Ok(compressed) => (
                StatusCode::OK,
                [(ContentType::HEADER, ContentType::BytesZstd.value())],
                compressed,
            )
                .into_response(),
            Err(err) => {
                warn!(?err, "cas compression failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    } else {
        (
            StatusCode::OK,
            [(ContentType::HEADER, ContentType::Bytes.value())],
            content,
        )
            .into_response()
    }
}

#[instrument(skip(cas))]
async fn cas_head(State(cas): State<LocalCas>, Path(hash): Path<String>) -> StatusCode {
    let Ok(hash) = ContentHash::parse(&hash) else {
        return StatusCode::BAD_REQUEST;
    };
    if cas.contains(&hash).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[instrument(skip(cas, headers, body))]
async fn cas_write(
    State(cas): State<LocalCas>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(hash) = ContentHash::parse(&hash) else {
        return StatusCode::BAD_REQUEST;
    };

    let compressed = headers
        .get(ContentType::HEADER)
        .is_some_and(|ct| ct == ContentType::BytesZstd);
    let content = if compressed {
        match decompress(&body).await {
            Ok(content) => content,
            Err(err) => {
                warn!(?err, "cas decompression failed");
                return StatusCode::BAD_REQUEST;
            }
        }
    } else {
        body.to_vec()
    };

    match cas.write(&hash, &content).await {
        Ok(true) => StatusCode::CREATED,
        Ok(false) => StatusCode::OK,
        Err(err) => {
            warn!(?err, "cas write rejected");
            StatusCode::BAD_REQUEST
        }
    }
}

// ── Worker routes ───────────────────────────────────────────────────────

/// The worker's service surface: attach, pip execution, exit, health, and
/// its content store.
pub fn worker_router<M, R, G, I>(
    service: Arc<WorkerService<M, R, G, I>>,
    cas: LocalCas,
) -> Router
where
    M: Monitor,
    R: RemoteStore,
    G: GlobalDirectory,
    I: IpcRelay,
{
    async fn attach<M, R, G, I>(
        State(service): State<Arc<WorkerService<M, R, G, I>>>,
        body: Bytes,
    ) -> Response
    where
        M: Monitor,
        R: RemoteStore,
        G: GlobalDirectory,
        I: IpcRelay,
    {
        let attach: Attach = match parse(&body) {
            Ok(attach) => attach,
            Err(response) => return response,
        };
        msgpack(&service.handle_attach(attach))
    }

    async fn pips<M, R, G, I>(
        State(service): State<Arc<WorkerService<M, R, G, I>>>,
        body: Bytes,
    ) -> Response
    where
        M: Monitor,
        R: RemoteStore,
        G: GlobalDirectory,
        I: IpcRelay,
    {
        let batch: ExecutePips = match parse(&body) {
            Ok(batch) => batch,
            Err(response) => return response,
        };
        service.handle_execute(batch);
        StatusCode::ACCEPTED.into_response()
    }

    async fn exit<M, R, G, I>(
        State(service): State<Arc<WorkerService<M, R, G, I>>>,
        body: Bytes,
    ) -> Response
    where
        M: Monitor,
        R: RemoteStore,
        G: GlobalDirectory,
        I: IpcRelay,
    {
        let exit: Exit = match parse(&body) {
            Ok(exit) => exit,
            Err(response) => return response,
        };
        msgpack(&service.handle_exit(exit))
    }

    Router::new()
        .route("/api/v1/attach", post(attach::<M, R, G, I>))
        .route("/api/v1/pips", post(pips::<M, R, G, I>))
        .route("/api/v1/exit", post(exit::<M, R, G, I>))
        .route(
            "/api/v1/health",
            get(|| async { axum::Json(serde_json::json!({ "status": "ok" })) }),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(service)
        .merge(cas_router(cas))
}

// ── Orchestrator routes ─────────────────────────────────────────────────

/// The orchestrator's service surface: hello, streamed results and logs,
/// heartbeats, health, and its content store.
///
/// Accepting a hello pushes the attach payload to the worker's location and
/// ingests its `AttachCompleted` reply.
pub fn orchestrator_router(orchestrator: Arc<Orchestrator>, cas: LocalCas) -> Router {
    async fn hello(State(orchestrator): State<Arc<Orchestrator>>, body: Bytes) -> Response {
        let hello: Hello = match parse(&body) {
            Ok(hello) => hello,
            Err(response) => return response,
        };
        let location = hello.worker_location.clone();
        let response = match orchestrator.hello(hello) {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, "hello rejected");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        if let HelloResponse::Accepted(_) = &response {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                if let Err(err) = push_attach(&orchestrator, &location).await {
                    warn!(%location, ?err, "attach push failed");
                }
            });
        }
        msgpack(&response)
    }

    async fn attach_completed(
        State(orchestrator): State<Arc<Orchestrator>>,
        body: Bytes,
    ) -> Response {
        let message: AttachCompleted = match parse(&body) {
            Ok(message) => message,
            Err(response) => return response,
        };
        orchestrator.attach_completed(message);
        StatusCode::OK.into_response()
    }

    async fn results(State(orchestrator): State<Arc<Orchestrator>>, body: Bytes) -> Response {
        let report: ReportPipResults = match parse(&body) {
            Ok(report) => report,
            Err(response) => return response,
        };
        orchestrator.report_results(report);
        StatusCode::OK.into_response()
    }

    async fn execution_log(
        State(orchestrator): State<Arc<Orchestrator>>,
        body: Bytes,
    ) -> Response {
        let report: ReportExecutionLog = match parse(&body) {
            Ok(report) => report,
            Err(response) => return response,
        };
        orchestrator.report_execution_log(report);
        StatusCode::OK.into_response()
    }

    async fn heartbeat(State(orchestrator): State<Arc<Orchestrator>>, body: Bytes) -> Response {
        let heartbeat: Heartbeat = match parse(&body) {
            Ok(heartbeat) => heartbeat,
            Err(response) => return response,
        };
        orchestrator.heartbeat(heartbeat);
        StatusCode::OK.into_response()
    }

    Router::new()
        .route("/api/v1/hello", post(hello))
        .route("/api/v1/attach_completed", post(attach_completed))
        .route("/api/v1/results", post(results))
        .route("/api/v1/execution_log", post(execution_log))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route(
            "/api/v1/health",
            get(|| async { axum::Json(serde_json::json!({ "status": "ok" })) }),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
        .merge(cas_router(cas))
}

/// Deliver the attach payload to a worker and ingest its reply.
async fn push_attach(
    orchestrator: &Arc<Orchestrator>,
    location: &wire::dist::v1::MachineLocation,
) -> Result<()> {
    let client = reqwest::Client::new();
    let url = url::Url::parse(location.as_str())
        .context("parse worker location")?
        .join("api/v1/attach")
        .context("join attach url")?;

    let response = client
        .post(url)
        .header(ContentType::HEADER, ContentType::MsgPack.value())
        .body(encode(&orchestrator.attach_payload())?)
        .send()
        .await
        .context("push attach")?;
    let body = response.bytes().await.context("read attach reply")?;
    let completed: AttachCompleted = decode(&body)?;
    orchestrator.attach_completed(completed);
    Ok(())
}
