//! Thin HTTP client seam so the pusher and query transformer can be driven
//! against a scripted endpoint in tests.

use async_trait::async_trait;
use common::knobs::PUSHER_REQUEST_TIMEOUT;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait FetchClient: Send + Sync + 'static {
    async fn post_json(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

pub struct ReqwestFetchClient {
    client: reqwest::Client,
}

impl ReqwestFetchClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(*PUSHER_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchClient for ReqwestFetchClient {
    async fn post_json(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}
