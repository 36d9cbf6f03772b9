//! Plain HTTP sink: `POST|PUT|DELETE {base}/{kind-plural}/{id}`.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use vista_core::{OpKind, Operation};

use crate::{Sink, SinkError};

pub struct HttpSink {
    name: String,
    base: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP sink client")?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self { name: format!("http:{}", base), base, client }
    }

    /// Verb and URL for an operation.
    pub fn route(&self, op: &Operation) -> (Method, String) {
        let r = op.resource();
        let url = format!("{}/{}/{}", self.base, r.kind().plural(), r.id());
        let method = match op.kind() {
            OpKind::Add => Method::POST,
            OpKind::Update => Method::PUT,
            OpKind::Delete => Method::DELETE,
        };
        (method, url)
    }
}

#[async_trait::async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str { &self.name }

    async fn deliver(&self, op: &Operation) -> Result<(), SinkError> {
        let (method, url) = self.route(op);
        let mut request = self.client.request(method.clone(), &url);
        if method != Method::DELETE {
            let body = op.resource().body_json().map_err(|e| SinkError::Encode(e.to_string()))?;
            request = request.json(&body);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Status { status: status.as_u16(), body })
    }
}
