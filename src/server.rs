//! Newline-delimited JSON over a Unix socket: request/response for queries,
//! mutations and pulls, plus live query subscriptions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Library, Message};
use crate::config::Config;
use crate::error::Result;
use crate::store::Query;

const QUEUE_CAPACITY: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum Frame {
    Query {
        #[serde(default)]
        request_id: Option<Value>,
        method_name: String,
        #[serde(default)]
        args: Value,
    },
    Mutate {
        #[serde(default)]
        request_id: Option<Value>,
        method_name: String,
        #[serde(default)]
        args: Value,
    },
    Pull {
        #[serde(default)]
        request_id: Option<Value>,
    },
    Subscribe {
        subscription_id: String,
        method_name: String,
        #[serde(default)]
        args: Value,
    },
    Unsubscribe {
        subscription_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: Value,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot { subscription_id: String, snapshot: Value },
    #[serde(rename_all = "camelCase")]
    SubscriptionFailed { subscription_id: String, error: String },
}

impl Reply {
    fn response(request_id: Option<Value>, outcome: Result<Value>) -> Self {
        let request_id = request_id.unwrap_or(Value::Null);
        match outcome {
            Ok(result) => Self::Response {
                request_id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::Response {
                request_id,
                ok: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Serve `library` on the configured socket until `shutdown` turns true.
pub async fn run(config: &Config, library: Arc<Library>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let socket_path = Path::new(&config.socket_path);
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if socket_path.exists() {
        let _ = tokio::fs::remove_file(socket_path).await;
    }

    let listener = UnixListener::bind(socket_path)?;
    let conn_counter = AtomicU64::new(0);
    info!(event = "server_start", socket = %socket_path.display());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let conn_id = conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        let library = library.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(conn_id, library, stream, shutdown).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "server_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = tokio::fs::remove_file(socket_path).await;
    info!(event = "server_stop");
    Ok(())
}

async fn handle_connection(
    conn_id: u64,
    library: Arc<Library>,
    stream: UnixStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader_half, writer_half) = stream.into_split();
    let mut lines = BufReader::new(reader_half).lines();
    let (tx, rx) = mpsc::channel::<Reply>(QUEUE_CAPACITY);
    let writer = tokio::spawn(writer_loop(conn_id, writer_half, rx));
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    info!(event = "client_connected", conn_id);

    loop {
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(event = "server_read_error", conn_id, error = %err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(reply) => {
                warn!(event = "server_decode_error", conn_id);
                if tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let reply = match frame {
            Frame::Query { request_id, method_name, args } => {
                let outcome = dispatch(&library, "query", &method_name, args).await;
                Some(Reply::response(request_id, outcome))
            }
            Frame::Mutate { request_id, method_name, args } => {
                let outcome = dispatch(&library, "mutate", &method_name, args).await;
                Some(Reply::response(request_id, outcome))
            }
            Frame::Pull { request_id } => {
                let outcome = library.handle(Message::Pull).await;
                Some(Reply::response(request_id, outcome))
            }
            Frame::Subscribe { subscription_id, method_name, args } => {
                match Query::parse(&method_name, args) {
                    Ok(query) => {
                        debug!(conn_id, subscription = %subscription_id, method = query.name(), "subscribe");
                        let task = spawn_subscription(&library, subscription_id.clone(), query, tx.clone());
                        if let Some(previous) = subscriptions.insert(subscription_id, task) {
                            previous.abort();
                        }
                        None
                    }
                    Err(e) => Some(Reply::SubscriptionFailed {
                        subscription_id,
                        error: e.to_string(),
                    }),
                }
            }
            Frame::Unsubscribe { subscription_id } => {
                if let Some(task) = subscriptions.remove(&subscription_id) {
                    task.abort();
                }
                None
            }
        };

        if let Some(reply) = reply {
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    for (_, task) in subscriptions.drain() {
        task.abort();
    }
    drop(tx);
    let _ = writer.await;
    info!(event = "client_disconnected", conn_id);
}

fn decode_frame(line: &str) -> std::result::Result<Frame, Reply> {
    let raw: Value = serde_json::from_str(line).map_err(|e| Reply::response(None, Err(e.into())))?;
    let request_id = raw.get("requestId").cloned();
    serde_json::from_value(raw).map_err(|e| Reply::response(request_id, Err(e.into())))
}

async fn dispatch(library: &Library, kind: &str, method: &str, args: Value) -> Result<Value> {
    let message = Message::parse(kind, method, args)?;
    library.handle(message).await
}

fn spawn_subscription(
    library: &Arc<Library>,
    subscription_id: String,
    query: Query,
    tx: mpsc::Sender<Reply>,
) -> JoinHandle<()> {
    let mut subscription = library.subscribe(query);
    tokio::spawn(async move {
        while let Some(snapshot) = subscription.next().await {
            let reply = Reply::Snapshot {
                subscription_id: subscription_id.clone(),
                snapshot,
            };
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    })
}

async fn writer_loop(conn_id: u64, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Reply>) {
    while let Some(reply) = rx.recv().await {
        let mut frame = match serde_json::to_vec(&reply) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "server_encode_error", conn_id, error = %err);
                continue;
            }
        };
        frame.push(b'\n');
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "server_write_error", conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "server_write_timeout", conn_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KvStore;
    use crate::store::ManualClock;
    use serde_json::json;
    use tokio::io::{BufReader, Lines};
    use tokio::net::unix::OwnedReadHalf;

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            for _ in 0..100 {
                if let Ok(stream) = UnixStream::connect(path).await {
                    let (reader, writer) = stream.into_split();
                    return Self {
                        lines: BufReader::new(reader).lines(),
                        writer,
                    };
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("server never came up at {}", path.display());
        }

        async fn send(&mut self, frame: Value) {
            let mut line = frame.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start() -> (tempfile::TempDir, Config, watch::Sender<bool>, JoinHandle<Result<()>>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("library.sock").to_string_lossy().to_string(),
            ..Config::default()
        };
        let store = KvStore::open_in_memory().await.unwrap();
        let library = Arc::new(Library::new(store, Arc::new(ManualClock::new(1_000))));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_config = config.clone();
        let server = tokio::spawn(async move { run(&server_config, library, shutdown_rx).await });
        (dir, config, shutdown_tx, server)
    }

    #[tokio::test]
    async fn answers_requests_by_id() {
        let (_dir, config, shutdown, server) = start().await;
        let mut client = Client::connect(Path::new(&config.socket_path)).await;

        client
            .send(json!({
                "requestId": 1,
                "type": "mutate",
                "methodName": "putTopic",
                "args": { "id": "t1", "name": "Rust" }
            }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], json!(1));
        assert_eq!(reply["ok"], json!(true));

        client
            .send(json!({ "requestId": "q", "type": "query", "methodName": "getTopic", "args": ["t1"] }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], json!("q"));
        assert_eq!(reply["result"]["name"], json!("Rust"));

        client
            .send(json!({ "requestId": 3, "type": "query", "methodName": "dropEverything", "args": [] }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["ok"], json!(false));
        assert!(reply["error"].as_str().unwrap().contains("dropEverything"));

        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!Path::new(&config.socket_path).exists());
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_reply() {
        let (_dir, config, shutdown, server) = start().await;
        let mut client = Client::connect(Path::new(&config.socket_path)).await;

        client.send(json!({ "requestId": 9, "type": "explode" })).await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], json!(9));
        assert_eq!(reply["ok"], json!(false));

        client.writer.write_all(b"not json\n").await.unwrap();
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], Value::Null);
        assert_eq!(reply["ok"], json!(false));

        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscriptions_stream_snapshots_until_unsubscribed() {
        let (_dir, config, shutdown, server) = start().await;
        let mut client = Client::connect(Path::new(&config.socket_path)).await;

        client
            .send(json!({ "type": "subscribe", "subscriptionId": "topics", "methodName": "listTopics", "args": [] }))
            .await;
        let first = client.recv().await;
        assert_eq!(first, json!({ "subscriptionId": "topics", "snapshot": [] }));

        client
            .send(json!({
                "requestId": 1,
                "type": "mutate",
                "methodName": "putTopic",
                "args": { "id": "t1", "name": "Rust" }
            }))
            .await;

        // The mutation reply and the new snapshot may arrive in either order.
        let mut snapshot = None;
        for _ in 0..2 {
            let frame = client.recv().await;
            if frame.get("subscriptionId").is_some() {
                snapshot = Some(frame["snapshot"].clone());
            } else {
                assert_eq!(frame["ok"], json!(true));
            }
        }
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot[0]["name"], json!("Rust"));

        client
            .send(json!({ "type": "unsubscribe", "subscriptionId": "topics" }))
            .await;
        client
            .send(json!({
                "requestId": 2,
                "type": "mutate",
                "methodName": "putTopic",
                "args": { "id": "t2", "name": "Go" }
            }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], json!(2));

        client
            .send(json!({ "requestId": 3, "type": "query", "methodName": "getArticlesCount", "args": [] }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], json!(3));
        assert_eq!(reply["result"], json!(0));

        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_subscription_queries_are_reported() {
        let (_dir, config, shutdown, server) = start().await;
        let mut client = Client::connect(Path::new(&config.socket_path)).await;

        client
            .send(json!({ "type": "subscribe", "subscriptionId": "s1", "methodName": "nope", "args": [] }))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["subscriptionId"], json!("s1"));
        assert!(reply["error"].is_string());

        shutdown.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
