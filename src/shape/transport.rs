//! HTTP access to the shape endpoint.

use std::future::Future;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;

use super::protocol::{self, WireMessage, HANDLE_HEADER, INITIAL_OFFSET, OFFSET_HEADER};
use crate::error::{SyncError, SyncResult};

/// One shape log request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub table: String,
    pub offset: String,
    pub handle: Option<String>,
    /// Long-poll for new changes instead of returning immediately.
    pub live: bool,
}

impl ShapeRequest {
    /// A request for the start of a table's shape.
    pub fn initial(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
            live: false,
        }
    }
}

/// What the shape endpoint answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeResponse {
    /// A page of the shape log, with the cursor to continue from.
    Messages {
        handle: Option<String>,
        offset: Option<String>,
        messages: Vec<WireMessage>,
    },
    /// The requested handle is gone upstream; refetch from scratch.
    MustRefetch,
}

impl ShapeResponse {
    pub fn messages(handle: &str, offset: &str, messages: Vec<WireMessage>) -> Self {
        ShapeResponse::Messages {
            handle: Some(handle.to_string()),
            offset: Some(offset.to_string()),
            messages,
        }
    }
}

/// Fetches pages of a table's shape log.
pub trait ShapeTransport: Send + Sync + 'static {
    fn fetch(
        &self,
        request: &ShapeRequest,
    ) -> impl Future<Output = SyncResult<ShapeResponse>> + Send;
}

/// [`ShapeTransport`] over the Electric HTTP shape API.
#[derive(Clone)]
pub struct HttpShapeTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpShapeTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Sends the key as a bearer token on every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_url(&self, request: &ShapeRequest) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}table={}&offset={}&replica=full",
            self.base_url,
            separator,
            urlencoding::encode(&request.table),
            urlencoding::encode(&request.offset),
        );
        if let Some(handle) = &request.handle {
            url.push_str("&handle=");
            url.push_str(&urlencoding::encode(handle));
        }
        if request.live {
            url.push_str("&live=true");
        }
        url
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl ShapeTransport for HttpShapeTransport {
    async fn fetch(&self, request: &ShapeRequest) -> SyncResult<ShapeResponse> {
        let url = self.build_url(request);
        debug!(table = %request.table, offset = %request.offset, live = request.live, "requesting shape");

        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            return Ok(ShapeResponse::MustRefetch);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::UpstreamStatus {
                status: status.as_u16(),
                message,
            });
        }

        let handle = header_string(response.headers(), HANDLE_HEADER);
        let offset = header_string(response.headers(), OFFSET_HEADER);
        let body = response.bytes().await?;
        let messages = protocol::decode_body(&body)?;

        Ok(ShapeResponse::Messages {
            handle,
            offset,
            messages,
        })
    }
}
