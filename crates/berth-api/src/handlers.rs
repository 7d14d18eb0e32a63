//! Thin axum handlers delegating to the [`Gatekeeper`].
//!
//! Bodies are taken as raw strings: request parsing belongs to the
//! gatekeeper so that malformed JSON surfaces as a status bit in a 200
//! response instead of an axum rejection.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::Gatekeeper;

fn json_body(body: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], body)
}

pub async fn register(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.register(&body).await)
}

pub async fn update(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.update(&body).await)
}

pub async fn status(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.status(&body).await)
}

pub async fn delete(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.delete(&body).await)
}

pub async fn compile(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.compile(&body).await)
}

pub async fn deploy(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.deploy(&body).await)
}

pub async fn start(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.start(&body).await)
}

pub async fn dispatch(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.dispatch(&body).await)
}

pub async fn stop(State(gatekeeper): State<Arc<Gatekeeper>>, body: String) -> impl IntoResponse {
    json_body(gatekeeper.stop(&body).await)
}
