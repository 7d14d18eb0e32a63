//! berth-api — HTTP control API for the berth control plane.
//!
//! One POST route per lifecycle command, all consuming and producing JSON
//! text bodies. Transport-level errors are reserved for the transport:
//! malformed input, illegal transitions and downstream failures all come
//! back as HTTP 200 with a non-zero `statuscode` bitmask in the body.
//!
//! # Routes
//!
//! | Path | Body | Effect |
//! |---|---|---|
//! | `/register/git` | `{timestamp, gitRepositoryUrl, username, password}` | clone + assign UUID |
//! | `/update/git` | `{timestamp, UUID, username, password}` | re-clone sources |
//! | `/status` | `{timestamp, UUID}` | report lifecycle state |
//! | `/delete` | `{timestamp, UUID}` | remove workload + resources |
//! | `/compile` | `{timestamp, UUID}` | queue compilation |
//! | `/deploy` | `{timestamp, UUID}` | queue image build |
//! | `/start` | `{timestamp, UUID}` | queue container start |
//! | `/dispatch` | `{timestamp, UUID, payload}` | relay payload to workload |
//! | `/stop` | `{timestamp, UUID}` | queue container stop |

pub mod gatekeeper;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::post;

pub use gatekeeper::Gatekeeper;

/// Build the control API router.
pub fn build_router(gatekeeper: Arc<Gatekeeper>) -> Router {
    Router::new()
        .route("/register/git", post(handlers::register))
        .route("/update/git", post(handlers::update))
        .route("/status", post(handlers::status))
        .route("/delete", post(handlers::delete))
        .route("/compile", post(handlers::compile))
        .route("/deploy", post(handlers::deploy))
        .route("/start", post(handlers::start))
        .route("/dispatch", post(handlers::dispatch))
        .route("/stop", post(handlers::stop))
        .with_state(gatekeeper)
}
