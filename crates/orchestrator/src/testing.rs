//! In-memory integrations for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use integrations_core::{FailurePolicy, Integration};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::channel::{ChannelOptions, ProcessChannel};
use crate::process::{HostInfo, IntegrationProcess, EVENT_METHOD_PREFIX, INITIALIZE_METHOD};
use crate::protocol::{self, Frame, RpcErrorObject};

/// How a fake integration answers event calls.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Reply(Value),
    Silent,
    RpcError(i64, &'static str),
    /// Drop both streams as if the process died.
    HangUp,
    /// Write this line verbatim, with `{id}` replaced by the request id.
    Raw(&'static str),
}

pub(crate) struct FakeIntegration {
    pub process: Arc<IntegrationProcess>,
    /// `(method, params)` of every event call received.
    pub received: Arc<Mutex<Vec<(String, Value)>>>,
}

pub(crate) fn status(status: &str) -> Behavior {
    Behavior::Reply(json!({ "status": status }))
}

/// Build an integration that is already `Ready` and subscribed to `events`.
pub(crate) async fn ready(
    name: &str,
    events: &[&str],
    policy: FailurePolicy,
    behavior: Behavior,
) -> FakeIntegration {
    let (host, peer) = duplex(64 * 1024);
    let (host_read, host_write) = split(host);
    let (peer_read, mut peer_write) = split(peer);

    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let init = json!({"name": name, "version": "1.0.0", "subscribedEvents": events});

    tokio::spawn(async move {
        let mut lines = BufReader::new(peer_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(Frame::Request(request)) = protocol::decode(line.as_bytes()) else {
                continue;
            };

            let reply = if request.method == INITIALIZE_METHOD {
                protocol::encode(&Frame::result(request.id, init.clone())).unwrap()
            } else if request.method.starts_with(EVENT_METHOD_PREFIX) {
                log.lock()
                    .unwrap()
                    .push((request.method.clone(), request.params.clone().unwrap_or_default()));
                match &behavior {
                    Behavior::Reply(value) => {
                        protocol::encode(&Frame::result(request.id, value.clone())).unwrap()
                    }
                    Behavior::Silent => continue,
                    Behavior::RpcError(code, message) => protocol::encode(&Frame::error(
                        request.id,
                        RpcErrorObject::new(*code, *message),
                    ))
                    .unwrap(),
                    Behavior::HangUp => return,
                    Behavior::Raw(line) => line.replace("{id}", &request.id.to_string()),
                }
            } else {
                continue;
            };

            if peer_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
    });

    let channel = ProcessChannel::new(name, host_read, host_write, ChannelOptions::default());
    let process = Arc::new(IntegrationProcess::from_channel(
        Integration::new(name, name).with_policy(policy),
        channel,
        None,
    ));
    process
        .initialize(&HostInfo::default(), Duration::from_secs(5))
        .await
        .unwrap();

    FakeIntegration { process, received }
}
