//! HTTP surface
//!
//! Every resource route funnels into the delegating router; this module only
//! translates between HTTP and [`RequestContext`].

use crate::AppState;
use crate::error::{ApiError, Result};
use crate::router::{Outcome, RequestContext, Verb, WatchStream};
use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, warn};

/// Path parameters shared by all resource routes
#[derive(Debug, Deserialize)]
struct ResourcePath {
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: Option<String>,
}

impl ResourcePath {
    fn into_context(self, verb: Verb) -> RequestContext {
        RequestContext {
            verb,
            group: self.group,
            version: self.version,
            resource: self.resource,
            namespace: self.namespace,
            name: self.name,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CollectionParams {
    #[serde(default)]
    watch: bool,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/apis/{group}/{version}/{resource}",
            get(list_or_watch).post(create),
        )
        .route(
            "/apis/{group}/{version}/{resource}/{name}",
            get(read).put(update).patch(patch).delete(remove),
        )
        .route(
            "/apis/{group}/{version}/namespaces/{namespace}/{resource}",
            get(list_or_watch).post(create),
        )
        .route(
            "/apis/{group}/{version}/namespaces/{namespace}/{resource}/{name}",
            get(read).put(update).patch(patch).delete(remove),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<axum::body::Body>| {
                    let matched_path = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map(MatchedPath::as_str)
                        .unwrap_or(request.uri().path());

                    tracing::debug_span!(
                        "http-request",
                        method = %request.method(),
                        uri = %request.uri(),
                        matched_path = matched_path,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let routes = state.router.routes().load();
    Json(json!({
        "status": "ok",
        "routes": routes.len(),
    }))
}

async fn list_or_watch(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    Query(params): Query<CollectionParams>,
) -> Result<Response> {
    let verb = if params.watch { Verb::Watch } else { Verb::List };
    dispatch(&state, path.into_context(verb), None).await
}

async fn create(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    body: Bytes,
) -> Result<Response> {
    dispatch(&state, path.into_context(Verb::Create), Some(parse_body(&body)?)).await
}

async fn read(State(state): State<AppState>, Path(path): Path<ResourcePath>) -> Result<Response> {
    dispatch(&state, path.into_context(Verb::Get), None).await
}

async fn update(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    body: Bytes,
) -> Result<Response> {
    dispatch(&state, path.into_context(Verb::Update), Some(parse_body(&body)?)).await
}

/// JSON merge patch
async fn patch(
    State(state): State<AppState>,
    Path(path): Path<ResourcePath>,
    body: Bytes,
) -> Result<Response> {
    dispatch(&state, path.into_context(Verb::Patch), Some(parse_body(&body)?)).await
}

async fn remove(State(state): State<AppState>, Path(path): Path<ResourcePath>) -> Result<Response> {
    dispatch(&state, path.into_context(Verb::Delete), None).await
}

// Content type is not checked so merge-patch bodies parse like any other JSON.
fn parse_body(body: &[u8]) -> Result<Value> {
    if body.is_empty() {
        return Err(ApiError::Invalid("request body is required".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::Invalid(format!("malformed JSON: {}", e)))
}

async fn dispatch(state: &AppState, ctx: RequestContext, body: Option<Value>) -> Result<Response> {
    let status = if ctx.verb == Verb::Create {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    match state.router.dispatch(&ctx, body).await? {
        Outcome::Object(value) => Ok((status, Json(value)).into_response()),
        Outcome::Watch(stream) => Ok(watch_response(stream).into_response()),
    }
}

fn watch_response(stream: WatchStream) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let events = stream.map(|event| {
        let sse_event = Event::default().event(event.event_type.as_str());
        match sse_event.json_data(&event) {
            Ok(sse_event) => Ok(sse_event),
            Err(e) => {
                warn!(error = %e, "Failed to encode watch event");
                Ok(Event::default().comment("failed to encode event"))
            }
        }
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
