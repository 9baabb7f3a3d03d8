//! Performance monitor middleware
//!
//! Measures each chat-completion request from arrival to the LAST byte of
//! the response body, so streamed responses are timed honestly instead of
//! being credited at header time. Neither body is buffered: the request
//! body is teed into a capped capture buffer on its way to the handler, and
//! the response body carries the timer with it, logging when the stream ends
//! or the client disconnects.
//!
//! Requests that enable engine tools legitimately take much longer than
//! plain chat, so the captured request prefix is sniffed at finish time to
//! pick the right threshold pair.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use http_body::Frame;
use parking_lot::Mutex;
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::config::env_parse;

/// Request-body capture cap. Enough for the flags and the leading messages;
/// huge prompts are truncated, not buffered.
const CAPTURE_CAP: usize = 64 * 1024;

const MONITORED_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub slow: Duration,
    pub very_slow: Duration,
    pub tool_slow: Duration,
    pub tool_very_slow: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow: Duration::from_secs(5),
            very_slow: Duration::from_secs(10),
            tool_slow: Duration::from_secs(30),
            tool_very_slow: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            slow: Duration::from_secs(env_parse("RELAY_SLOW_SECS", d.slow.as_secs())),
            very_slow: Duration::from_secs(env_parse("RELAY_VERY_SLOW_SECS", d.very_slow.as_secs())),
            tool_slow: Duration::from_secs(env_parse("RELAY_TOOL_SLOW_SECS", d.tool_slow.as_secs())),
            tool_very_slow: Duration::from_secs(env_parse(
                "RELAY_TOOL_VERY_SLOW_SECS",
                d.tool_very_slow.as_secs(),
            )),
        }
    }

    fn thresholds(&self, class: RequestClass) -> (Duration, Duration) {
        match class {
            RequestClass::Chat => (self.slow, self.very_slow),
            RequestClass::Tool => (self.tool_slow, self.tool_very_slow),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestClass {
    Chat,
    Tool,
}

impl RequestClass {
    fn label(self) -> &'static str {
        match self {
            RequestClass::Chat => "chat",
            RequestClass::Tool => "tool",
        }
    }
}

#[derive(Clone)]
pub struct PerfMonitorLayer {
    config: MonitorConfig,
}

impl PerfMonitorLayer {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for PerfMonitorLayer {
    type Service = PerfMonitor<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerfMonitor {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct PerfMonitor<S> {
    inner: S,
    config: MonitorConfig,
}

impl<S> Service<Request<Body>> for PerfMonitor<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<TimedBody>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Clone-and-swap so the readied service handles this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let monitored = req.uri().path() == MONITORED_PATH;
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let captured = Arc::new(Mutex::new(Vec::new()));

            let req = if monitored {
                let (parts, body) = req.into_parts();
                let tapped = Body::new(TapBody {
                    inner: body,
                    captured: captured.clone(),
                });
                Request::from_parts(parts, tapped)
            } else {
                req
            };

            let start = Instant::now();
            let resp = inner.call(req).await?;
            let status = resp.status().as_u16();
            let (parts, body) = resp.into_parts();

            let flight = monitored.then(|| Flight {
                start,
                captured,
                config,
                method,
                path,
                status,
            });
            Ok(Response::from_parts(parts, TimedBody { inner: body, flight }))
        })
    }
}

/// Request body wrapper teeing frames into a capped capture buffer while
/// forwarding them unchanged.
struct TapBody {
    inner: Body,
    captured: Arc<Mutex<Vec<u8>>>,
}

impl http_body::Body for TapBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let mut buf = this.captured.lock();
                    let room = CAPTURE_CAP.saturating_sub(buf.len());
                    let take = room.min(data.len());
                    buf.extend_from_slice(&data[..take]);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }
}

struct Flight {
    start: Instant,
    captured: Arc<Mutex<Vec<u8>>>,
    config: MonitorConfig,
    method: String,
    path: String,
    status: u16,
}

impl Flight {
    fn finish(self, complete: bool) {
        let elapsed = self.start.elapsed();
        let class = classify(&self.captured.lock());
        let (slow, very_slow) = self.config.thresholds(class);

        if elapsed >= very_slow {
            error!(
                method = %self.method,
                path = %self.path,
                status = self.status,
                class = class.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                complete,
                "request VERY slow"
            );
        } else if elapsed >= slow {
            warn!(
                method = %self.method,
                path = %self.path,
                status = self.status,
                class = class.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                complete,
                "request slow"
            );
        } else {
            debug!(
                method = %self.method,
                path = %self.path,
                status = self.status,
                class = class.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                complete,
                "request finished"
            );
        }
    }
}

/// Response body wrapper that stops the clock at the last byte. `Drop`
/// covers client disconnects mid-stream.
pub struct TimedBody {
    inner: Body,
    flight: Option<Flight>,
}

impl http_body::Body for TimedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(flight) = this.flight.take() {
                    flight.finish(true);
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(flight) = this.flight.take() {
                    flight.finish(false);
                }
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for TimedBody {
    fn drop(&mut self) {
        if let Some(flight) = self.flight.take() {
            flight.finish(false);
        }
    }
}

/// Best-effort classification from the captured request prefix. A parse
/// failure (truncated capture) degrades to substring sniffing, and anything
/// unrecognizable counts as plain chat.
fn classify(body: &[u8]) -> RequestClass {
    let Ok(text) = std::str::from_utf8(body) else {
        return RequestClass::Chat;
    };

    if let Ok(v) = serde_json::from_str::<Value>(text) {
        if v.get("enable_tools").and_then(Value::as_bool) == Some(true) {
            return RequestClass::Tool;
        }
        if let Some(messages) = v.get("messages").and_then(Value::as_array) {
            let research = messages.iter().any(|m| {
                m.get("content")
                    .and_then(Value::as_str)
                    .map(|c| {
                        let c = c.trim_start();
                        c.starts_with("/sc:research") || c.starts_with("/research")
                    })
                    .unwrap_or(false)
            });
            if research {
                return RequestClass::Tool;
            }
        }
        return RequestClass::Chat;
    }

    if text.contains("\"enable_tools\":true") || text.contains("\"enable_tools\": true") {
        return RequestClass::Tool;
    }
    RequestClass::Chat
}
