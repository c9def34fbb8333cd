//! Request/response channel over one integration's stdio.
//!
//! A [`ProcessChannel`] owns the write half of the stream behind an async
//! lock and runs a background read loop that routes each response to the
//! call waiting on its id. The channel works over any `AsyncRead` /
//! `AsyncWrite` pair; [`ProcessChannel::spawn`] wires it to a child process.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use events::{Event, EventBus};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::protocol::{self, Frame, FrameReader, ProtocolError, DEFAULT_MAX_FRAME_BYTES};

/// Environment variable carrying the configured integration name.
pub const INTEGRATION_NAME_ENV: &str = "INTEGRATION_NAME";

/// Cap for deadlines that would overflow `Instant`; roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

type Reply = Result<Value>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub max_frame_bytes: usize,
    pub events: Option<EventBus>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            events: None,
        }
    }
}

struct PendingCalls {
    next_id: u64,
    calls: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// State shared between the channel handle and its read loop.
struct Shared {
    name: String,
    pending: StdMutex<PendingCalls>,
    closed_tx: watch::Sender<bool>,
    events: Option<EventBus>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Hand a reply to the call waiting on `id`. Returns false if none is.
    fn deliver(&self, id: u64, reply: Reply) -> bool {
        let sender = lock(&self.pending).calls.remove(&id);
        match sender {
            // The receiver may have just timed out; that still counts as matched.
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }

    /// Mark the channel closed and fail every outstanding call.
    fn close(&self) {
        let calls = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };

        if !calls.is_empty() {
            debug!(
                integration = %self.name,
                pending = calls.len(),
                "Failing pending calls on closed channel"
            );
        }
        for (_, tx) in calls {
            let _ = tx.send(Err(OrchestratorError::ChannelClosed));
        }

        self.closed_tx.send_replace(true);
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                let id = response.id;
                let reply = response.outcome.map_err(|e| OrchestratorError::Rpc {
                    code: e.code,
                    message: e.message,
                });
                if !self.deliver(id, reply) {
                    debug!(integration = %self.name, id, "Dropping response with no outstanding call");
                    self.publish(Event::UnmatchedResponse {
                        integration: self.name.clone(),
                        id,
                    });
                }
            }
            Frame::Notification(notification) => {
                debug!(
                    integration = %self.name,
                    method = %notification.method,
                    "Unsolicited notification from integration"
                );
                self.publish(Event::IntegrationNotification {
                    integration: self.name.clone(),
                    method: notification.method,
                    params: notification.params,
                });
            }
            Frame::Request(request) => {
                debug!(
                    integration = %self.name,
                    method = %request.method,
                    id = request.id,
                    "Ignoring request from integration"
                );
                self.publish(Event::IntegrationNotification {
                    integration: self.name.clone(),
                    method: request.method,
                    params: request.params,
                });
            }
        }
    }

    fn handle_protocol_error(&self, err: ProtocolError) {
        warn!(integration = %self.name, error = %err, "Discarding bad frame from integration");
        self.publish(Event::FrameError {
            integration: self.name.clone(),
            message: err.to_string(),
        });

        if let Some(id) = err.id() {
            self.deliver(id, Err(err.into()));
        }
    }
}

/// Removes a pending call when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).calls.remove(&self.id);
    }
}

pub struct ProcessChannel {
    shared: Arc<Shared>,
    writer: Mutex<Option<BoxedWriter>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessChannel {
    /// Build a channel over an arbitrary stream pair and start its read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W, options: ChannelOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: name.into(),
            pending: StdMutex::new(PendingCalls {
                next_id: 0,
                calls: HashMap::new(),
                closed: false,
            }),
            closed_tx,
            events: options.events,
        });

        let frames = FrameReader::new(BufReader::new(reader), options.max_frame_bytes);
        let reader_task = tokio::spawn(read_loop(shared.clone(), frames));

        Self {
            shared,
            writer: Mutex::new(Some(Box::new(writer))),
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    /// Spawn `program` with piped stdio and attach a channel to it.
    ///
    /// The child is killed when the returned [`Child`] is dropped. Its stderr
    /// is logged line by line at warn level.
    pub fn spawn(
        name: &str,
        program: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        options: ChannelOptions,
    ) -> Result<(Self, Child)> {
        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .env(INTEGRATION_NAME_ENV, name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::startup(
                    name,
                    format!("failed to spawn {}: {}", program.display(), e),
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::startup(name, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::startup(name, "stdout was not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(name.to_string(), stderr, options.events.clone()));
        }

        debug!(integration = %name, pid = ?child.id(), "Spawned integration process");

        Ok((Self::new(name, stdout, stdin, options), child))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` covers both writing the request and waiting for the reply.
    /// On expiry the call is forgotten; the peer is left running.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let deadline = deadline_after(timeout);

        let (id, rx) = {
            let mut pending = lock(&self.shared.pending);
            if pending.closed {
                return Err(OrchestratorError::ChannelClosed);
            }
            pending.next_id += 1;
            let id = pending.next_id;
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(id, tx);
            (id, rx)
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let line = protocol::encode(&Frame::request(id, method, params))?;

        match tokio::time::timeout_at(deadline, self.write_line(line)).await {
            Ok(written) => written?,
            Err(_) => {
                // A half-written request would corrupt every later frame.
                warn!(
                    integration = %self.shared.name,
                    method = %method,
                    "Timed out writing request, closing channel"
                );
                self.close_now();
                return Err(OrchestratorError::timeout(method, timeout));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(OrchestratorError::ChannelClosed),
            Err(_) => {
                debug!(integration = %self.shared.name, method = %method, id, "Call timed out");
                Err(OrchestratorError::timeout(method, timeout))
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(OrchestratorError::ChannelClosed);
        }
        let line = protocol::encode(&Frame::notification(method, params))?;
        self.write_line(line).await
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        if self.shared.is_closed() {
            writer.take();
            return Err(OrchestratorError::ChannelClosed);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(OrchestratorError::ChannelClosed);
        };

        let result = match stream.write_all(&bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            debug!(integration = %self.shared.name, error = %e, "Write to integration failed");
            OrchestratorError::ChannelClosed
        })
    }

    /// Close the channel. Safe to call more than once.
    ///
    /// Pending calls fail with [`OrchestratorError::ChannelClosed`], the read
    /// loop stops, and the write side is shut down so the peer sees EOF.
    pub async fn close(&self) {
        self.shared.close();
        self.stop_reader();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(integration = %self.shared.name, error = %e, "Error shutting down integration stdin");
            }
        }
    }

    /// Synchronous close for paths that cannot wait on the write lock.
    fn close_now(&self) {
        self.shared.close();
        self.stop_reader();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn stop_reader(&self) {
        let task = lock(&self.reader_task).take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Watch that flips to `true` once the channel is closed for any reason.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).calls.len()
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.shared.close();
        self.stop_reader();
    }
}

impl std::fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessChannel")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// `now + timeout`, saturated so huge timeouts mean "effectively never".
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FrameReader<R>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match frames.next_frame().await {
            Ok(Some(Ok(frame))) => shared.handle_frame(frame),
            Ok(Some(Err(err))) => shared.handle_protocol_error(err),
            Ok(None) => {
                debug!(integration = %shared.name, "Integration closed its output stream");
                break;
            }
            Err(e) => {
                warn!(integration = %shared.name, error = %e, "Failed to read from integration");
                break;
            }
        }
    }

    shared.close();
}

async fn log_stderr(name: String, stderr: ChildStderr, events: Option<EventBus>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(integration = %name, "{}", line);
                if let Some(bus) = &events {
                    bus.publish(Event::IntegrationStderr {
                        integration: name.clone(),
                        line,
                    });
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(integration = %name, error = %e, "Stopped reading integration stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, split, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn read_frame(&mut self) -> Frame {
            let line = self.lines.next_line().await.unwrap().expect("peer saw EOF");
            protocol::decode(line.as_bytes()).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, frame: Frame) {
            let line = protocol::encode(&frame).unwrap();
            self.send_raw(&line).await;
        }
    }

    fn connect(events: Option<EventBus>) -> (ProcessChannel, Peer) {
        let (host, peer) = duplex(64 * 1024);
        let (host_read, host_write) = split(host);
        let (peer_read, peer_write) = split(peer);

        let channel = ProcessChannel::new(
            "test",
            host_read,
            host_write,
            ChannelOptions {
                events,
                ..Default::default()
            },
        );
        let peer = Peer {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };
        (channel, peer)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_call_round_trip() {
        let (channel, mut peer) = connect(None);

        let responder = async {
            let frame = peer.read_frame().await;
            assert_eq!(frame.method(), Some("initialize"));
            assert_eq!(frame.id(), Some(1));
            peer.send(Frame::result(1, json!({"name": "test"}))).await;
        };

        let (result, ()) = tokio::join!(channel.call("initialize", None, LONG), responder);
        assert_eq!(result.unwrap(), json!({"name": "test"}));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (channel, mut peer) = connect(None);

        let responder = async {
            let mut requests = Vec::new();
            for _ in 0..3 {
                match peer.read_frame().await {
                    Frame::Request(request) => requests.push(request),
                    other => panic!("expected request, got {other:?}"),
                }
            }
            for request in requests.into_iter().rev() {
                let n = request.params.unwrap()["n"].clone();
                peer.send(Frame::result(request.id, n)).await;
            }
        };

        let (a, b, c, ()) = tokio::join!(
            channel.call("event:x", Some(json!({"n": 1})), LONG),
            channel.call("event:x", Some(json!({"n": 2})), LONG),
            channel.call("event:x", Some(json!({"n": 3})), LONG),
            responder
        );

        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
        assert_eq!(c.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_ids_increase_from_one() {
        let (channel, mut peer) = connect(None);

        for expected in 1..=3u64 {
            let responder = async {
                let frame = peer.read_frame().await;
                assert_eq!(frame.id(), Some(expected));
                peer.send(Frame::result(expected, json!(null))).await;
            };
            let (result, ()) = tokio::join!(channel.call("ping", None, LONG), responder);
            assert_eq!(result.unwrap(), Value::Null);
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_call() {
        let (channel, mut peer) = connect(None);

        let result = channel
            .call("event:slow", None, Duration::from_millis(50))
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_closed());

        // A late response is dropped without disturbing the channel.
        peer.read_frame().await;
        peer.send(Frame::result(1, json!({}))).await;

        let responder = async {
            let frame = peer.read_frame().await;
            peer.send(Frame::result(frame.id().unwrap(), json!("ok"))).await;
        };
        let (result, ()) = tokio::join!(channel.call("ping", None, LONG), responder);
        assert_eq!(result.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let (channel, mut peer) = connect(None);

        let responder = async {
            let frame = peer.read_frame().await;
            peer.send(Frame::result(frame.id().unwrap(), json!("ok"))).await;
        };

        let (result, ()) = tokio::join!(
            channel.call("ping", None, Duration::from_secs(u64::MAX)),
            responder
        );
        assert_eq!(result.unwrap(), json!("ok"));
    }

    #[test]
    fn test_deadline_saturates() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(86400 * 365));
    }

    #[tokio::test]
    async fn test_rpc_error_response() {
        let (channel, mut peer) = connect(None);

        let responder = async {
            let frame = peer.read_frame().await;
            peer.send(Frame::error(
                frame.id().unwrap(),
                protocol::RpcErrorObject::new(-32601, "unknown event"),
            ))
            .await;
        };

        let (result, ()) = tokio::join!(channel.call("event:nope", None, LONG), responder);
        match result.unwrap_err() {
            OrchestratorError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "unknown event");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_response_fails_its_call() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (channel, mut peer) = connect(Some(bus));

        let responder = async {
            peer.read_frame().await;
            peer.send_raw(r#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#).await;
        };

        let (result, ()) = tokio::join!(channel.call("event:x", None, LONG), responder);
        assert!(matches!(
            result.unwrap_err(),
            OrchestratorError::Protocol(ProtocolError::MalformedFrame { id: Some(1), .. })
        ));

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::FrameError { .. }));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_calls() {
        let (channel, peer) = connect(None);
        let mut closed = channel.subscribe_closed();

        let hang_up = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(peer);
        };

        let (result, ()) = tokio::join!(channel.call("event:x", None, LONG), hang_up);
        assert!(result.unwrap_err().is_channel_closed());

        closed.wait_for(|closed| *closed).await.unwrap();
        assert!(channel.is_closed());

        let after = channel.call("event:x", None, LONG).await;
        assert!(after.unwrap_err().is_channel_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, mut peer) = connect(None);

        channel.close().await;
        channel.close().await;

        assert!(channel.is_closed());
        assert!(peer.lines.next_line().await.unwrap().is_none());
        assert!(channel.notify("shutdown", None).await.unwrap_err().is_channel_closed());
    }

    #[tokio::test]
    async fn test_notify_writes_notification() {
        let (channel, mut peer) = connect(None);

        channel.notify("shutdown", None).await.unwrap();

        let line = peer.lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"shutdown"}"#);
    }

    #[tokio::test]
    async fn test_unsolicited_frames_go_to_event_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (_channel, mut peer) = connect(Some(bus));

        peer.send(Frame::notification("progress", Some(json!({"pct": 50}))))
            .await;
        peer.send(Frame::result(99, json!({}))).await;

        match rx.recv().await.unwrap().event {
            Event::IntegrationNotification { method, params, .. } => {
                assert_eq!(method, "progress");
                assert_eq!(params, Some(json!({"pct": 50})));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap().event {
            Event::UnmatchedResponse { id, .. } => assert_eq!(id, 99),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
