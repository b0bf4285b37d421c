//! `web.get` — HTTP GET for scripts, with in-flight request sharing.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value as Json;
use tracing::debug;

use crate::collaborators::DownstreamError;
use crate::error::{ExecError, ExecResult};

type FetchResult = Result<String, DownstreamError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// HTTP client shared by every context of an engine.
///
/// Concurrent `web.get` calls for the same bare URL share one in-flight
/// request; requests with custom headers bypass the sharing. Failures carry
/// the response code and reject like any other downstream error.
pub struct WebClient {
    client: reqwest::Client,
    inflight: DashMap<String, SharedFetch>,
}

impl Default for WebClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WebClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            inflight: DashMap::new(),
        }
    }

    pub async fn get(
        &self,
        url: String,
        headers: Option<HashMap<String, String>>,
    ) -> ExecResult<Json> {
        debug!(url = %url, "web.get");

        let result = match headers {
            Some(headers) if !headers.is_empty() => {
                fetch(self.client.clone(), url, Some(headers)).await
            }
            _ => {
                let shared = match self.inflight.entry(url.clone()) {
                    Entry::Occupied(occupied) => occupied.get().clone(),
                    Entry::Vacant(vacant) => {
                        let future = fetch(self.client.clone(), url.clone(), None)
                            .boxed()
                            .shared();
                        vacant.insert(future.clone());
                        future
                    }
                };
                let result = shared.await;
                self.inflight.remove(&url);
                result
            }
        };

        result.map(Json::String).map_err(ExecError::from)
    }
}

async fn fetch(
    client: reqwest::Client,
    url: String,
    headers: Option<HashMap<String, String>>,
) -> FetchResult {
    url::Url::parse(&url)
        .map_err(|e| DownstreamError::new(400, format!("Invalid URL: {e}")))?;

    let mut request = client.get(&url);
    if let Some(headers) = headers {
        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_str(&key), HeaderValue::from_str(&value))
            {
                header_map.insert(name, value);
            }
        }
        request = request.headers(header_map);
    }

    let response = request
        .send()
        .await
        .map_err(|e| DownstreamError::new(599, format!("HTTP request failed: {e}")))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| DownstreamError::new(599, format!("Failed to read response body: {e}")))?;

    if !(200..300).contains(&status) {
        return Err(DownstreamError::new(status, body));
    }
    Ok(body)
}
