//! Tower layer that requires a shared secret in the `Authorization` header.

use std::{convert::Infallible, sync::Arc, task::Poll};

use axum::{
    http::{header::AUTHORIZATION, Request},
    response::{IntoResponse, Response},
};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::http_error::HttpError;

#[derive(Clone)]
pub struct AuthorizationLayer {
    secret: Arc<str>,
}

impl AuthorizationLayer {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl<S> Layer<S> for AuthorizationLayer {
    type Service = AuthorizationMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationMiddleware {
            inner,
            secret: self.secret.clone(),
        }
    }
}

/// Answers 401 without an `Authorization` header and 403 with a wrong one.
#[derive(Clone)]
pub struct AuthorizationMiddleware<S> {
    inner: S,
    secret: Arc<str>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for AuthorizationMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let secret = self.secret.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match req.headers().get(AUTHORIZATION) {
                None => Ok(HttpError::unauthorized("Authorization header missing").into_response()),
                Some(value) if value.as_bytes() == secret.as_bytes() => inner.call(req).await,
                Some(_) => Ok(HttpError::forbidden("Authorization header invalid").into_response()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use axum_test::TestServer;
    use serde_json::json;

    fn server() -> TestServer {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(AuthorizationLayer::new("secret"));
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn missing_header() {
        let response = server().get("/").await;
        response.assert_status_unauthorized();
        response.assert_json(&json!({ "message": "Authorization header missing" }));
    }

    #[tokio::test]
    async fn wrong_secret() {
        let response = server()
            .get("/")
            .add_header(AUTHORIZATION, "nope")
            .await;
        response.assert_status_forbidden();
        response.assert_json(&json!({ "message": "Authorization header invalid" }));
    }

    #[tokio::test]
    async fn correct_secret() {
        let response = server()
            .get("/")
            .add_header(AUTHORIZATION, "secret")
            .await;
        response.assert_status_ok();
        response.assert_text("ok");
    }
}
