use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use evaluator::{EvalError, Evaluator, RequestContext, RunResponse};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::EvaldResult;

const DECODE_ERROR: &str = "could not decode request as valid json";
const INVALID_KEY: &str = "permission denied; invalid key";

#[derive(Clone)]
pub struct AppState {
    evaluator: Arc<Evaluator>,
    psk: Arc<str>,
}

impl AppState {
    pub fn new(evaluator: Arc<Evaluator>, psk: &str) -> Self {
        Self {
            evaluator,
            psk: Arc::from(psk),
        }
    }
}

/// Missing fields decode as empty strings; an empty key never matches.
#[derive(Default, Deserialize)]
#[serde(default)]
struct EvalRequest {
    key: String,
    env: String,
    contents: String,
}

#[derive(Serialize)]
struct EvalReply {
    response: RunResponse,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", post(eval))
        .route("/eval", post(eval))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves, then let in-flight
/// requests finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> EvaldResult<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn eval(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(req) = serde_json::from_slice::<EvalRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, DECODE_ERROR).into_response();
    };
    if !constant_time_compare(req.key.as_bytes(), state.psk.as_bytes()) {
        warn!(env = %req.env, "rejected request with invalid key");
        return (StatusCode::UNAUTHORIZED, INVALID_KEY).into_response();
    }

    info!(env = %req.env, bytes = req.contents.len(), "evaluation requested");
    let ctx = RequestContext::with_timeout(state.evaluator.ceiling());
    match state.evaluator.handle(&req.env, &req.contents, &ctx).await {
        Ok(response) => (StatusCode::OK, Json(EvalReply { response })).into_response(),
        Err(e) => error_response(&e),
    }
}

// TODO: answer 503 for ErrorKind::ProviderUnavailable and ResourceExhausted
// once clients no longer depend on every failure being a 400.
fn error_response(err: &EvalError) -> Response {
    let body = match err {
        EvalError::Provision(e) => format!("unable to start environment: {e}"),
        EvalError::Run(e) => format!("error running code: {e}"),
    };
    (StatusCode::BAD_REQUEST, body).into_response()
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
