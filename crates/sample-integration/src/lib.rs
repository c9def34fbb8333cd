//! Reference integration process.
//!
//! Speaks the integration protocol over stdio: one JSON-RPC frame per line on
//! stdin, answers on stdout, logs on stderr. It logs every event it receives
//! and applies a small action policy to resource payloads.
//!
//! Startup config (the `[integration.config]` table on the host side):
//! - `events`: events to subscribe to (default: every well-known event)
//! - `log_file`: append one JSON line per event to this file
//! - `deny_actions`: payload actions that get a `fail` verdict
//! - `warn_actions`: payload actions that get a `warn` verdict

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use integrations_core::{event_names, HookResult};
use orchestrator::protocol::{encode, Frame, FrameReader, Request, RpcErrorObject};
use orchestrator::process::{EVENT_METHOD_PREFIX, INITIALIZE_METHOD, SHUTDOWN_METHOD};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const NAME: &str = "sample-integration";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Frames larger than this are rejected on read.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub events: Option<Vec<String>>,
    pub log_file: Option<PathBuf>,
    pub deny_actions: Vec<String>,
    pub warn_actions: Vec<String>,
}

impl SampleConfig {
    pub fn subscribed_events(&self) -> Vec<String> {
        match &self.events {
            Some(events) => events.clone(),
            None => event_names::ALL.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Verdict for one event payload.
    pub fn evaluate(&self, payload: &Value) -> HookResult {
        let Some(action) = payload.get("action").and_then(Value::as_str) else {
            return HookResult::success();
        };
        let address = payload
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");

        if self.deny_actions.iter().any(|a| a == action) {
            HookResult::fail(format!("{} of {} is not allowed", action, address))
                .with_metadata("action", json!(action))
        } else if self.warn_actions.iter().any(|a| a == action) {
            HookResult::warn(format!("{} of {} needs review", action, address))
                .with_metadata("action", json!(action))
        } else {
            HookResult::success()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InitializeParams {
    name: Option<String>,
    host_name: Option<String>,
    host_version: Option<String>,
    config: Option<Value>,
}

/// What the serve loop should do after handling a frame.
#[derive(Debug, PartialEq)]
pub enum Reply {
    Send(Frame),
    SendAndExit(Frame),
    Nothing,
}

/// Protocol state of one integration process.
#[derive(Debug)]
pub struct SampleIntegration {
    name: String,
    config: SampleConfig,
    initialized: bool,
}

impl SampleIntegration {
    /// `name` is the fallback used until the host sends one in `initialize`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SampleConfig::default(),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    pub async fn handle(&mut self, frame: Frame) -> Reply {
        match frame {
            Frame::Request(request) => self.handle_request(request).await,
            Frame::Notification(notification) => {
                debug!(method = %notification.method, "Ignoring notification");
                Reply::Nothing
            }
            Frame::Response(response) => {
                warn!(id = response.id, "Unexpected response from host");
                Reply::Nothing
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Reply {
        let Request { id, method, params } = request;

        if method == INITIALIZE_METHOD {
            return match self.initialize(params) {
                Ok(result) => Reply::Send(Frame::result(id, result)),
                Err(e) => Reply::Send(Frame::error(
                    id,
                    RpcErrorObject::new(RpcErrorObject::INVALID_PARAMS, e.to_string()),
                )),
            };
        }

        if method == SHUTDOWN_METHOD {
            info!(integration = %self.name, "Shutdown requested");
            return Reply::SendAndExit(Frame::result(id, Value::Null));
        }

        let Some(event) = method.strip_prefix(EVENT_METHOD_PREFIX) else {
            return Reply::Send(Frame::error(
                id,
                RpcErrorObject::new(
                    RpcErrorObject::METHOD_NOT_FOUND,
                    format!("method not found: {}", method),
                ),
            ));
        };

        if !self.initialized {
            return Reply::Send(Frame::error(
                id,
                RpcErrorObject::new(RpcErrorObject::INVALID_REQUEST, "not initialized"),
            ));
        }

        let payload = params.unwrap_or(Value::Null);
        let verdict = self.on_event(event, &payload).await;
        match serde_json::to_value(&verdict) {
            Ok(result) => Reply::Send(Frame::result(id, result)),
            Err(e) => Reply::Send(Frame::error(
                id,
                RpcErrorObject::new(RpcErrorObject::INTERNAL_ERROR, e.to_string()),
            )),
        }
    }

    fn initialize(&mut self, params: Option<Value>) -> Result<Value> {
        let params: InitializeParams = match params {
            Some(value) => serde_json::from_value(value).context("invalid initialize params")?,
            None => InitializeParams::default(),
        };

        if let Some(config) = params.config {
            self.config = serde_json::from_value(config).context("invalid config")?;
        }
        if let Some(name) = params.name {
            self.name = name;
        }
        self.initialized = true;

        let events = self.config.subscribed_events();
        info!(
            integration = %self.name,
            host = params.host_name.as_deref().unwrap_or("-"),
            host_version = params.host_version.as_deref().unwrap_or("-"),
            events = events.len(),
            "Initialized"
        );

        Ok(json!({
            "name": self.name,
            "version": VERSION,
            "subscribedEvents": events,
        }))
    }

    async fn on_event(&self, event: &str, payload: &Value) -> HookResult {
        info!(integration = %self.name, event = %event, payload = %payload, "Event received");

        if let Some(path) = &self.config.log_file {
            if let Err(e) = append_log(path, event, payload).await {
                warn!(path = %path.display(), error = %e, "Failed to append event log");
            }
        }

        self.config.evaluate(payload)
    }
}

async fn append_log(path: &Path, event: &str, payload: &Value) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut line = json!({ "event": event, "payload": payload }).to_string();
    line.push('\n');
    file.write_all(line.as_bytes()).await
}

/// Serve frames from `reader` until `shutdown` or EOF.
pub async fn serve<R, W>(integration: &mut SampleIntegration, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameReader::new(reader, MAX_FRAME_BYTES);

    while let Some(next) = frames.next_frame().await.context("failed to read stdin")? {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                if let Some(id) = e.id() {
                    let error = RpcErrorObject::new(RpcErrorObject::PARSE_ERROR, e.to_string());
                    write_frame(&mut writer, &Frame::error(id, error)).await?;
                }
                continue;
            }
        };

        match integration.handle(frame).await {
            Reply::Send(frame) => write_frame(&mut writer, &frame).await?,
            Reply::SendAndExit(frame) => {
                write_frame(&mut writer, &frame).await?;
                return Ok(());
            }
            Reply::Nothing => {}
        }
    }

    info!(integration = %integration.name(), "Host closed stdin");
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut line = encode(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
