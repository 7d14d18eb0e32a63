//! berth-dispatch — synchronous relay of payloads to running workloads.
//!
//! One operation: POST an opaque text payload to the workload's `/process`
//! endpoint and hand the body back verbatim. No retries, no per-request
//! timeout beyond the transport default; a stalled workload stalls the
//! calling request.

use thiserror::Error;
use tracing::debug;

use berth_core::config::DispatchConfig;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct DispatchGateway {
    client: reqwest::Client,
    machine_url: String,
}

impl DispatchGateway {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        let mut builder = reqwest::Client::builder();
        if !config.http_proxy_host.is_empty() {
            let proxy = format!(
                "http://{}:{}",
                config.http_proxy_host, config.http_proxy_port
            );
            builder = builder.proxy(reqwest::Proxy::http(&proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            machine_url: config.machine_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, port: u16) -> String {
        format!("{}:{}/process", self.machine_url, port)
    }

    /// Forward `payload` to the workload listening on `port`; returns the
    /// response body, empty string included.
    pub async fn dispatch(&self, port: u16, payload: &str) -> DispatchResult<String> {
        let endpoint = self.endpoint(port);
        debug!(%endpoint, "dispatching payload");
        let response = self
            .client
            .post(&endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .header(reqwest::header::ACCEPT, "text/plain")
            .body(payload.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    fn gateway() -> DispatchGateway {
        DispatchGateway::new(&DispatchConfig {
            machine_url: "http://127.0.0.1".to_string(),
            ..DispatchConfig::default()
        })
        .unwrap()
    }

    /// Serve `router` on an ephemeral local port, returning the port.
    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn dispatch_returns_body_verbatim() {
        let router = Router::new().route(
            "/process",
            post(|body: String| async move { format!("echo:{body}") }),
        );
        let port = serve(router).await;

        let response = gateway().dispatch(port, "{\"Text\":\"Hi\"}").await.unwrap();
        assert_eq!(response, "echo:{\"Text\":\"Hi\"}");
    }

    #[tokio::test]
    async fn empty_response_body_yields_empty_string() {
        let router = Router::new().route("/process", post(|| async { "" }));
        let port = serve(router).await;

        let response = gateway().dispatch(port, "{}").await.unwrap();
        assert_eq!(response, "");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/process",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let port = serve(router).await;

        assert!(gateway().dispatch(port, "{}").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_workload_is_an_error() {
        // Nothing listens on this port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(gateway().dispatch(port, "{}").await.is_err());
    }
}
