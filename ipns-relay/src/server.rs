//!
//! HTTP relay: accepts records on `POST /broadcast`.
//!

use std::{
    net::{SocketAddr, TcpListener},
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use axum_server::Handle;
use ipns_publisher::Ingest;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use url::Url;

use crate::{
    auth::AuthorizationLayer,
    http_error::{HttpError, HttpResult},
};

const ROOT_PAGE: &str = r#"<!doctype html>
<body style="font-family: -apple-system, system-ui">
  <h1>⁂</h1>
  <p>IPNS records can be published to the /broadcast endpoint.</p>
</body>
"#;

#[derive(Clone)]
struct AppState {
    ingest: Ingest,
}

/// Builder for [BroadcastServer].
pub struct BroadcastServerBuilder {
    ingest: Ingest,
    listen_socket: SocketAddr,
    auth_secret: Option<String>,
}

impl BroadcastServerBuilder {
    /// Socket to listen on. Defaults to an OS assigned port on localhost.
    pub fn listen_socket(mut self, socket: SocketAddr) -> Self {
        self.listen_socket = socket;
        self
    }

    /// Require this value in the `Authorization` header of `/broadcast`.
    pub fn auth_secret(mut self, secret: Option<String>) -> Self {
        self.auth_secret = secret;
        self
    }

    /// Start serving.
    pub async fn run(self) -> Result<BroadcastServer> {
        BroadcastServer::start(self).await
    }
}

/// Running HTTP relay. Shuts down when dropped.
pub struct BroadcastServer {
    http_handle: Handle,
    http_address: SocketAddr,
}

impl BroadcastServer {
    pub fn builder(ingest: Ingest) -> BroadcastServerBuilder {
        BroadcastServerBuilder {
            ingest,
            listen_socket: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_secret: None,
        }
    }

    /// Creates the router. Extracted to test it without a socket.
    pub(crate) fn create_app(ingest: Ingest, auth_secret: Option<String>) -> Router {
        let mut broadcast = Router::new().route("/broadcast", post(broadcast_handler));
        if let Some(secret) = auth_secret {
            broadcast = broadcast.route_layer(AuthorizationLayer::new(secret));
        }

        Router::new()
            .route("/", get(root_handler))
            .merge(broadcast)
            .fallback(|| async { HttpError::not_found() })
            .layer(CorsLayer::very_permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { ingest })
    }

    async fn start(builder: BroadcastServerBuilder) -> Result<Self> {
        if builder.auth_secret.is_none() {
            tracing::warn!("No auth secret configured, /broadcast accepts every request.");
        }
        let app = Self::create_app(builder.ingest, builder.auth_secret);

        let http_handle = Handle::new();
        let listener = TcpListener::bind(builder.listen_socket)?;
        listener.set_nonblocking(true)?;
        let http_address = listener.local_addr()?;

        let server = axum_server::from_tcp(listener);
        let handle = http_handle.clone();
        tokio::spawn(async move {
            server
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|error| tracing::error!(?error, "Broadcast server error"))
        });
        tracing::info!("Broadcast server listening on http://{http_address}");

        Ok(Self {
            http_handle,
            http_address,
        })
    }

    pub fn http_address(&self) -> SocketAddr {
        self.http_address
    }

    /// The url of the broadcast endpoint on localhost.
    pub fn broadcast_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!(
            "http://localhost:{}/broadcast",
            self.http_address.port()
        ))?)
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.http_handle
            .graceful_shutdown(Some(Duration::from_secs(1)));
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.http_handle.shutdown();
    }
}

async fn root_handler() -> impl IntoResponse {
    Html(ROOT_PAGE)
}

async fn broadcast_handler(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> HttpResult<impl IntoResponse> {
    let Json(payload) = payload?;
    state.ingest.submit_json(&payload).await?;
    Ok(Json(json!({ "message": "Success" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;
    use axum_test::TestServer;
    use ipns_publisher::{
        test_utils::{MockStore, RecordFactory},
        Coordinator,
    };
    use std::sync::Arc;

    fn app(store: &MockStore, auth_secret: Option<&str>) -> TestServer {
        let ingest = Ingest::new(Coordinator::new(Arc::new(store.clone())));
        let app = BroadcastServer::create_app(ingest, auth_secret.map(str::to_string));
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn root_page() {
        let server = app(&MockStore::new(), Some("secret"));
        let response = server.get("/").await;
        response.assert_status_ok();
        assert!(response.text().contains("/broadcast"));
    }

    #[tokio::test]
    async fn unknown_route() {
        let server = app(&MockStore::new(), None);
        let response = server.get("/nope").await;
        response.assert_status_not_found();
        response.assert_json(&json!({ "message": "not found" }));
    }

    #[tokio::test]
    async fn broadcast_requires_authorization() {
        let server = app(&MockStore::new(), Some("secret"));
        let factory = RecordFactory::new(1);
        let body = json!({
            "key": factory.key().as_str(),
            "record": factory.record(1).build_base64(),
        });

        server
            .post("/broadcast")
            .json(&body)
            .await
            .assert_status_unauthorized();
        server
            .post("/broadcast")
            .add_header(AUTHORIZATION, "wrong")
            .json(&body)
            .await
            .assert_status_forbidden();
        let response = server
            .post("/broadcast")
            .add_header(AUTHORIZATION, "secret")
            .json(&body)
            .await;
        response.assert_status_ok();
        response.assert_json(&json!({ "message": "Success" }));
    }

    #[tokio::test]
    async fn broadcast_rejections() {
        let server = app(&MockStore::new(), None);
        let factory = RecordFactory::new(1);
        let other = RecordFactory::new(2);

        let response = server
            .post("/broadcast")
            .json(&json!({ "key": factory.key().as_str() }))
            .await;
        response.assert_status_bad_request();
        response.assert_json(&json!({ "message": "JSON payload missing key 'record'" }));

        let response = server
            .post("/broadcast")
            .json(&json!({
                "key": factory.key().as_str(),
                "record": other.record(1).build_base64(),
            }))
            .await;
        response.assert_status_bad_request();

        let response = server
            .post("/broadcast")
            .json(&json!({
                "key": factory.key().as_str(),
                "record": factory
                    .record(1)
                    .embed_public_key(other.public_key().to_protobuf())
                    .build_base64(),
            }))
            .await;
        response.assert_status_not_found();

        let response = server
            .post("/broadcast")
            .text("{ not json")
            .content_type("application/json")
            .await;
        response.assert_status_bad_request();
    }
}
