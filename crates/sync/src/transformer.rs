//! Client query ASTs are rewritten by the user's API server before
//! hydration: the get-queries endpoint receives symbolic query references
//! and returns authorized, fully-rewritten ASTs. This service owns that HTTP
//! exchange; the view-syncer calls it before hydrating a query set.

use std::sync::Arc;

use common::knobs::TRANSFORMER_REQUEST_TIMEOUT;
use errors::ErrorBody;
use serde_json::Value as JsonValue;
use sync_types::{
    TransformRequest,
    TransformRequestEntry,
    TransformResponse,
};

use crate::fetch::{
    FetchClient,
    HttpRequest,
};

#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// The user's get-queries endpoint.
    pub get_queries_url: String,
    pub api_key: Option<String>,
    pub app_id: String,
    pub upstream_schema: String,
}

pub struct QueryTransformer {
    config: TransformerConfig,
    fetch: Arc<dyn FetchClient>,
}

impl QueryTransformer {
    pub fn new(config: TransformerConfig, fetch: Arc<dyn FetchClient>) -> Self {
        Self { config, fetch }
    }

    /// Transform a batch of queries. Infrastructure failures (unreachable
    /// endpoint, non-OK status, unparseable body) come back as a
    /// `TransformFailed` wire error rather than an internal error: the
    /// client needs to know its queries were not authorized.
    pub async fn transform(
        &self,
        jwt: Option<&str>,
        cookie: Option<&str>,
        entries: Vec<TransformRequestEntry>,
    ) -> anyhow::Result<Result<TransformResponse, ErrorBody>> {
        let mut target = url::Url::parse(&self.config.get_queries_url).map_err(|e| {
            anyhow::anyhow!(
                "Get-queries URL {} failed to parse: {e}",
                self.config.get_queries_url
            )
        })?;
        target
            .query_pairs_mut()
            .append_pair("schema", &self.config.upstream_schema)
            .append_pair("appID", &self.config.app_id);
        let mut headers = vec![("Content-Type".to_owned(), "application/json".to_owned())];
        if let Some(api_key) = &self.config.api_key {
            headers.push(("X-Api-Key".to_owned(), api_key.clone()));
        }
        if let Some(jwt) = jwt {
            headers.push(("Authorization".to_owned(), format!("Bearer {jwt}")));
        }
        if let Some(cookie) = cookie {
            headers.push(("Cookie".to_owned(), cookie.to_owned()));
        }
        let request = HttpRequest {
            url: target.to_string(),
            headers,
            body: JsonValue::from(TransformRequest { entries }),
        };
        let response = tokio::time::timeout(
            *TRANSFORMER_REQUEST_TIMEOUT,
            self.fetch.post_json(request),
        )
        .await;
        let response = match response {
            Err(_) => {
                return Ok(Err(ErrorBody::transform_failed(
                    "Timed out reaching the get-queries endpoint",
                )))
            },
            Ok(Err(e)) => {
                return Ok(Err(ErrorBody::transform_failed(format!(
                    "Failed to reach the get-queries endpoint: {e:#}"
                ))))
            },
            Ok(Ok(response)) => response,
        };
        if !response.is_ok() {
            return Ok(Err(ErrorBody::transform_failed(format!(
                "Get-queries endpoint returned HTTP {}",
                response.status
            ))));
        }
        let parsed: JsonValue = match serde_json::from_str(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(Err(ErrorBody::transform_failed(format!(
                    "Unparseable get-queries response: {e}"
                ))))
            },
        };
        match TransformResponse::try_from(parsed) {
            Ok(response) => Ok(Ok(response)),
            Err(e) => Ok(Err(ErrorBody::transform_failed(format!(
                "Invalid get-queries response: {e:#}"
            )))),
        }
    }
}
