//!
//! src/browser.rs  Andrew Belles  Oct 18th, 2025
//!
//! Attaches to an already running, already logged in browser through its
//! remote debugging endpoint and drives one tab over the devtools protocol
//!

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::errors::ArchiverError;
use crate::fetch::{DevToolsClient, DevToolsTarget};

const OUTER_HTML_JS: &str = "document.documentElement.outerHTML";
const READY_STATE_JS: &str = "document.readyState";
const LOCATION_JS: &str = "location.href";
const READY_POLL: Duration = Duration::from_millis(250);

/// One script-controlled tab. Every call blocks the caller until the
/// browser answers, so implementations are driven strictly sequentially.
#[async_trait]
pub trait PageDriver: Send {
    /// Runs a script in the page and returns its value
    async fn evaluate(&mut self, expression: &str) -> Result<Value, ArchiverError>;

    /// Loads `url` and waits until the document reports ready
    async fn navigate(&mut self, url: &str) -> Result<(), ArchiverError>;

    async fn content(&mut self) -> Result<String, ArchiverError> {
        match self.evaluate(OUTER_HTML_JS).await? {
            Value::String(html) => Ok(html),
            other => Err(ArchiverError::Navigation(format!("page html was {other}")))
        }
    }

    async fn current_url(&mut self) -> Result<String, ArchiverError> {
        Ok(self.evaluate(LOCATION_JS).await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct CdpSession {
    socket: Socket,
    next_id: u64,
    call_timeout: Duration,
    target: DevToolsTarget
}

impl std::fmt::Debug for CdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpSession")
            .field("target", &self.target)
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Prefers a tab already on the library's host, else the first page tab
pub fn pick_target<'a>(targets: &'a [DevToolsTarget], host: Option<&str>) -> Option<&'a DevToolsTarget> {
    let pages = || targets.iter()
        .filter(|t| t.kind == "page" && t.web_socket_debugger_url.is_some());
    host.and_then(|h| pages().find(|t| t.url.contains(h)))
        .or_else(|| pages().next())
}

impl CdpSession {
    /// Attach to the running browser. Any failure here is fatal for a run.
    pub async fn attach(devtools: &DevToolsClient, cfg: &BrowserConfig) -> Result<Self, ArchiverError> {
        info!(endpoint = %cfg.endpoint(), "browser.attach");

        let targets = devtools.list_targets().await.map_err(|e| ArchiverError::Connection(
            format!("{e}; start the browser with --remote-debugging-port={}", cfg.debug_port)
        ))?;

        let target = pick_target(&targets, cfg.library_url.host_str())
            .cloned()
            .ok_or_else(|| ArchiverError::Connection(
                "no debuggable page tab is open".to_string()
            ))?;
        let ws_url = target.web_socket_debugger_url.clone().unwrap_or_default();

        let (socket, _) = connect_async(ws_url.as_str()).await
            .map_err(|e| ArchiverError::Connection(format!("devtools socket {ws_url}: {e}")))?;

        info!(tab = %target.url, title = %target.title, "browser.attached");
        Ok( Self { socket, next_id: 0, call_timeout: cfg.nav_timeout, target } )
    }

    /// Sends one protocol command and waits for the reply with the same id;
    /// events arriving in between are dropped.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, ArchiverError> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "id": id, "method": method, "params": params });
        self.socket.send(Message::Text(request.to_string())).await?;

        let deadline = Instant::now() + self.call_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = timeout(remaining, self.socket.next()).await
                .map_err(|_| ArchiverError::Timeout(format!("{method} after {:?}", self.call_timeout)))?;

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ArchiverError::Navigation("devtools socket closed".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into())
            };

            let reply: Value = serde_json::from_str(&text)?;
            if reply.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(ArchiverError::Navigation(format!("{method}: {error}")));
            }
            return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn wait_ready(&mut self) -> Result<(), ArchiverError> {
        let deadline = Instant::now() + self.call_timeout;
        loop {
            if self.evaluate(READY_STATE_JS).await?.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ArchiverError::Timeout("document never became ready".to_string()));
            }
            sleep(READY_POLL).await;
        }
    }
}

#[async_trait]
impl PageDriver for CdpSession {
    async fn evaluate(&mut self, expression: &str) -> Result<Value, ArchiverError> {
        let result = self.call("Runtime.evaluate", json!({
            "expression": expression,
            "returnByValue": true,
            "awaitPromise": true
        })).await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details.pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script exception");
            return Err(ArchiverError::Navigation(format!("script failed: {text}")));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    async fn navigate(&mut self, url: &str) -> Result<(), ArchiverError> {
        debug!(url, "browser.navigate");
        let result = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            warn!(url, error, "browser.navigate.error");
            return Err(ArchiverError::Navigation(format!("{url}: {error}")));
        }
        self.wait_ready().await
    }
}
