//! Authenticated HTTP fetch capability.
//!
//! The stream client never manages sessions itself; callers inject an
//! [`XrpcFetch`] that knows the host and credential. [`HttpXrpcClient`] is a
//! `reqwest` implementation with a static bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::FirehoseError;

/// Performs authenticated XRPC queries (`GET /xrpc/{nsid}`).
#[async_trait]
pub trait XrpcFetch: Send + Sync {
    async fn query(
        &self,
        nsid: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, FirehoseError>;
}

/// XRPC error response format.
#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

/// `reqwest`-backed fetch capability.
pub struct HttpXrpcClient {
    http: Client,
    host_url: String,
    access_token: Option<String>,
}

impl HttpXrpcClient {
    /// Create a client for the given host (e.g. `https://bsky.network`).
    pub fn new(host_url: impl Into<String>) -> Result<Self, FirehoseError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            host_url: host_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        })
    }

    /// Attach a bearer credential to every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    async fn handle_response(
        &self,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, FirehoseError> {
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                FirehoseError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;

            if let Ok(xrpc_error) = serde_json::from_str::<XrpcErrorBody>(&text) {
                return Err(FirehoseError::Xrpc {
                    error: xrpc_error.error,
                    message: xrpc_error.message,
                });
            }

            return Err(FirehoseError::InvalidResponse(format!(
                "request failed ({}): {}",
                status, text
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl XrpcFetch for HttpXrpcClient {
    async fn query(
        &self,
        nsid: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, FirehoseError> {
        let url = format!("{}/xrpc/{}", self.host_url, nsid);
        debug!(url = %url, "xrpc query");

        let mut request = self.http.get(&url).query(params);
        if let Some(ref token) = self.access_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_query_sends_bearer_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.sync.listRepos"))
            .and(header("Authorization", "Bearer secret"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "repos": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpXrpcClient::new(server.uri())
            .unwrap()
            .with_access_token("secret");
        let body = client
            .query("com.atproto.sync.listRepos", &[("limit", "10".to_string())])
            .await
            .unwrap();

        assert_eq!(body["repos"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_query_maps_xrpc_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "InvalidRequest",
                "message": "bad cursor"
            })))
            .mount(&server)
            .await;

        let client = HttpXrpcClient::new(server.uri()).unwrap();
        let err = client
            .query("com.atproto.sync.listRepos", &[])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FirehoseError::Xrpc { ref error, ref message }
                if error == "InvalidRequest" && message == "bad cursor"
        ));
    }

    #[tokio::test]
    async fn test_query_non_xrpc_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = HttpXrpcClient::new(server.uri()).unwrap();
        let err = client.query("com.atproto.sync.listRepos", &[]).await.unwrap_err();
        assert!(matches!(err, FirehoseError::InvalidResponse(_)));
    }
}
