// src/pipeline.rs

//! Boundary to the HTTP request pipeline.
//!
//! Authentication, wire-level retries and response decoding belong to the
//! pipeline; the transfer manager only interprets status, headers and body.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Head,
    Delete,
}

/// A request relative to the pipeline's service root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub method: Method,
    /// `container/blob`, without a leading slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PipelineRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn put(path: impl Into<String>, body: Bytes) -> Self {
        let mut request = Self::new(Method::Put, path);
        request.body = body;
        request
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Request bytes `[start, end)`.
    pub fn with_range(self, start: u64, end: u64) -> Self {
        self.with_header("range", format!("bytes={}-{}", start, end.saturating_sub(1)))
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl PipelineResponse {
    pub fn new(status: u16, body: Bytes) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Total object size from `Content-Range: bytes a-b/total`.
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.header("content-range")?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    /// Turn a non-2xx status into the matching execution error.
    pub fn error_for_status(self) -> Result<Self, ExecutionError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ExecutionError::from_status(self.status))
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<PipelineError> for ExecutionError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Timeout => ExecutionError::Timeout,
            PipelineError::Connect(msg) | PipelineError::Transport(msg) => {
                ExecutionError::Network(msg)
            }
            PipelineError::InvalidRequest(msg) => ExecutionError::Protocol(msg),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Timeout
        } else if err.is_connect() {
            PipelineError::Connect(err.to_string())
        } else if err.is_builder() {
            PipelineError::InvalidRequest(err.to_string())
        } else {
            PipelineError::Transport(err.to_string())
        }
    }
}

/// Sends one request and returns the decoded response.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn send(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError>;
}

/// Plain reqwest-backed pipeline against a service root URL.
#[derive(Debug, Clone)]
pub struct ReqwestPipeline {
    client: Client,
    base_url: String,
    default_headers: Vec<(String, String)>,
    /// Already-encoded query sent with every request, e.g. a shared-access
    /// signature.
    default_query: Option<String>,
}

impl ReqwestPipeline {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(concat!("blob-transfer/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers: Vec::new(),
            default_query: None,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Send `query` (for example a SAS token) with every request. It must
    /// already be percent-encoded and is passed through unchanged.
    pub fn with_query_string(mut self, query: &str) -> Self {
        let query = query.trim_start_matches('?');
        self.default_query = (!query.is_empty()).then(|| query.to_string());
        self
    }

    fn url(&self, path: &str) -> Result<Url, PipelineError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
        url.set_query(self.default_query.as_deref());
        Ok(url)
    }
}

#[async_trait]
impl Pipeline for ReqwestPipeline {
    async fn send(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Head => reqwest::Method::HEAD,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .client
            .request(method, self.url(&request.path)?)
            .query(&request.query);
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.method == Method::Put {
            builder = builder.body(request.body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let mut body = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(frame) = stream.next().await {
            body.extend_from_slice(&frame?);
        }

        Ok(PipelineResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}
