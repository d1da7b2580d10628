//! JSON-RPC client for the backend control connection.
//!
//! One TCP connection carries every call. Requests are written as
//! newline-delimited JSON objects (the codec the backend's `net/rpc`
//! server speaks); a reader thread routes each response to the waiting
//! caller by request id, so calls may be issued from several threads
//! without assuming any ordering between two outstanding calls.

use log::{info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// Every call maps to one invocation of `RPCServer.<method>` on the backend.
const SERVICE_PREFIX: &str = "RPCServer.";

#[derive(Debug)]
pub enum RpcError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The backend answered with its `error` field set.
    Backend(String),
    ConnectionClosed(String),
    PoisonedLock(&'static str),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Io(e) => write!(f, "io error: {e}"),
            RpcError::Json(e) => write!(f, "json error: {e}"),
            RpcError::Backend(msg) => write!(f, "{msg}"),
            RpcError::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            RpcError::PoisonedLock(name) => write!(f, "poisoned lock: {name}"),
        }
    }
}

impl Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Json(e)
    }
}

/// The one primitive the rest of the bridge needs from the control
/// connection. Implemented by [`RpcClient`]; tests substitute scripted fakes.
pub trait RpcCall: Send + Sync {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    fn close(&self) {}
}

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Result<Value, RpcError>>>>>;

pub struct RpcClient {
    writer: Mutex<TcpStream>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect and start the response reader thread.
    pub fn connect(host: &str, port: u16) -> Result<Arc<RpcClient>, RpcError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        let client = Arc::new(RpcClient {
            writer: Mutex::new(stream),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        });
        let pending = Arc::clone(&client.pending);
        thread::spawn(move || read_loop(reader_stream, pending));
        Ok(client)
    }

    /// Issue `RPCServer.<method>` and block until its response arrives.
    ///
    /// No timeout: the backend can legitimately take arbitrary time
    /// (a `continue` returns only when the target stops).
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RpcError::PoisonedLock("pending"))?;
            pending.insert(id, tx);
        }
        let request = json!({
            "method": format!("{SERVICE_PREFIX}{method}"),
            "params": [params],
            "id": id,
        });
        let line = serde_json::to_string(&request)?;
        info!("RPC -> {line}");
        {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| RpcError::PoisonedLock("writer"))?;
            let written = writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush());
            if let Err(e) = written {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                return Err(RpcError::Io(e));
            }
        }
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionClosed(format!(
                "no response for {method} (id {id})"
            ))),
        }
    }

    /// Close the connection. Outstanding calls complete with
    /// `ConnectionClosed` once the reader drains.
    pub fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

impl RpcCall for RpcClient {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        RpcClient::call(self, method, params)
    }

    fn close(&self) {
        RpcClient::close(self)
    }
}

fn read_loop(stream: TcpStream, pending: PendingMap) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("rpc read error: {e}");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        info!("RPC <- {trimmed}");
        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!("rpc response parse error: {e}");
                continue;
            }
        };
        let id = match parsed.get("id").and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                warn!("rpc response without id: {trimmed}");
                continue;
            }
        };
        let outcome = match parsed.get("error") {
            Some(Value::Null) | None => Ok(parsed.get("result").cloned().unwrap_or(Value::Null)),
            Some(Value::String(msg)) => Err(RpcError::Backend(msg.clone())),
            Some(other) => Err(RpcError::Backend(other.to_string())),
        };
        let waiter = match pending.lock() {
            Ok(mut map) => map.remove(&id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!("rpc response for unknown id {id}"),
        }
    }
    // connection gone: fail everything still waiting
    if let Ok(mut map) = pending.lock() {
        for (id, tx) in map.drain() {
            let _ = tx.send(Err(RpcError::ConnectionClosed(format!(
                "backend connection closed before response to id {id}"
            ))));
        }
    }
}
