//! Forwarding relayed requests to target services
//!
//! Any status the target answers with is relayed unchanged. Only a failure
//! to talk to the target becomes a synthesized 500.

use std::time::{Duration, Instant};
use tracing::{error, info};
use url::Url;

use rtunnel_shared::headers::{from_header_map, remove, strip_hop_by_hop, to_header_map};
use rtunnel_shared::protocol::{non_empty, ForwardEvent, ForwardResponse, ResponseData};
use rtunnel_shared::RelayError;

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Log each relayed request's method, url and headers
    pub dump_request: bool,
    /// Log each target response's headers
    pub dump_response: bool,
    /// Send the public Host header to the target instead of the target's own
    pub preserve_host: bool,
    /// Per-call timeout talking to a target
    pub timeout: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            dump_request: false,
            dump_response: false,
            preserve_host: false,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ForwardingExecutor {
    http: reqwest::Client,
    options: ForwardOptions,
}

impl ForwardingExecutor {
    pub fn new(options: ForwardOptions) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(options.timeout)
            .build()?;
        Ok(Self { http, options })
    }

    /// Perform the call and package the outcome as a response envelope.
    pub async fn execute(&self, target: &Url, event: &ForwardEvent) -> ForwardResponse {
        match self.call(target, event).await {
            Ok(response) => ForwardResponse {
                correlation_id: event.correlation_id,
                response,
            },
            Err(e) => {
                error!(
                    correlation_id = %event.correlation_id,
                    method = %event.request.method,
                    target = %target,
                    error = %e,
                    "forwarding failed"
                );
                ForwardResponse::failed(event.correlation_id, &e)
            }
        }
    }

    async fn call(&self, target: &Url, event: &ForwardEvent) -> Result<ResponseData, RelayError> {
        let req = &event.request;
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| RelayError::UpstreamTransportFailure(format!("invalid method {}", req.method)))?;
        let url = resolve_url(target, &req.url)
            .map_err(|e| RelayError::UpstreamTransportFailure(format!("invalid url {}: {}", req.url, e)))?;

        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);
        if !self.options.preserve_host {
            remove(&mut headers, "host");
        }

        if self.options.dump_request {
            info!(
                correlation_id = %event.correlation_id,
                headers = ?req.headers,
                body_len = req.body.as_ref().map_or(0, Vec::len),
                trace_context = ?event.trace_context,
                "request dump"
            );
        }
        info!(correlation_id = %event.correlation_id, "{} {}", req.method, url);

        let mut builder = self.http.request(method, url.clone()).headers(to_header_map(&headers));
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| RelayError::UpstreamTransportFailure(e.to_string()))?;

        let status = resp.status();
        let headers = from_header_map(resp.headers());
        if self.options.dump_response {
            info!(correlation_id = %event.correlation_id, headers = ?headers, "response dump");
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| RelayError::UpstreamTransportFailure(e.to_string()))?;

        info!(
            correlation_id = %event.correlation_id,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "{} {}",
            req.method,
            url
        );

        Ok(ResponseData {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: non_empty(body.to_vec()),
        })
    }
}

/// Combine a target base with the request's path and query. The path always
/// resolves against the target's authority, never to another host.
pub fn resolve_url(target: &Url, path_and_query: &str) -> Result<Url, url::ParseError> {
    let path = format!("/{}", path_and_query.trim_start_matches(['/', '\\']));
    target.join(&path)
}
