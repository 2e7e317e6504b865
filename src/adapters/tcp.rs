//! TCP Device Adapter
//!
//! Implements the `Connector` / `DeviceConnection` ports over a plain TCP
//! stream using length-prefixed JSON frames:
//!
//! ```text
//! ┌──────────────┬────────────────────────────┐
//! │ len: u32 BE  │ JSON Request / Response    │
//! └──────────────┴────────────────────────────┘
//! ```
//!
//! One request is in flight per connection. [`serve_device`] exposes an
//! [`InMemoryCluster`] device over the same framing, which gives a local
//! stand-in for a drive during development and in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::memory::InMemoryCluster;
use crate::domain::ports::{
    ConnectSettings, Connector, DeviceConnection, DeviceId, Entry, KeyRange, Synchronization,
};
use crate::error::{Error, Result};

/// Largest frame accepted in either direction (64 MiB).
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Delay between connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Get { key: String },
    GetKeyRange { range: KeyRange },
    GetPrevious { key: String },
    Put { key: String, value: Bytes, sync: Synchronization },
    Delete { key: String },
    DeleteKeys { keys: Vec<String> },
    PushKeys { target: DeviceId, keys: Vec<String> },
    CopyKeys { target: DeviceId, keys: Vec<String> },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::GetKeyRange { .. } => "get_key_range",
            Request::GetPrevious { .. } => "get_previous",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::DeleteKeys { .. } => "delete_keys",
            Request::PushKeys { .. } => "push_keys",
            Request::CopyKeys { .. } => "copy_keys",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok,
    Entry { entry: Option<Entry> },
    Keys { keys: Vec<String> },
    Error { message: String, refused: bool },
}

type Transport<S> = Framed<S, LengthDelimitedCodec>;

/// Wrap a byte stream in `u32` big-endian length-prefixed framing.
fn framed<S: AsyncRead + AsyncWrite>(io: S) -> Transport<S> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(io)
}

async fn send_message<S, T>(transport: &mut Transport<S>, message: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    transport.send(Bytes::from(payload)).await?;
    Ok(())
}

async fn recv_message<S, T>(transport: &mut Transport<S>) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match transport.next().await {
        Some(frame) => Ok(serde_json::from_slice(&frame?)?),
        None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

// =============================================================================
// Client
// =============================================================================

/// Connection to a device speaking the framed protocol.
pub struct TcpConnection {
    device: DeviceId,
    transport: Mutex<Transport<TcpStream>>,
    response_timeout: Duration,
    broken: AtomicBool,
}

impl TcpConnection {
    async fn call(&self, request: Request) -> Result<Response> {
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::Connection {
                device: self.device.to_string(),
                message: "connection is no longer usable".to_string(),
            });
        }
        let operation = request.name();
        let mut transport = self.transport.lock().await;
        let exchange = async {
            send_message(&mut *transport, &request).await?;
            recv_message::<_, Response>(&mut *transport).await
        };
        let response = match timeout(self.response_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                return Err(self.classify(e));
            }
            Err(_) => {
                // a late reply would desynchronise the stream
                self.broken.store(true, Ordering::Release);
                return Err(Error::Timeout {
                    device: self.device.to_string(),
                    operation: operation.to_string(),
                    timeout_secs: self.response_timeout.as_secs(),
                });
            }
        };
        match response {
            Response::Error { refused: true, .. } => Err(Error::ConnectionRefused {
                device: self.device.to_string(),
            }),
            Response::Error { message, .. } => Err(Error::Device {
                device: self.device.to_string(),
                message,
            }),
            other => Ok(other),
        }
    }

    fn classify(&self, err: Error) -> Error {
        match err {
            Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Error::ConnectionRefused {
                    device: self.device.to_string(),
                }
            }
            Error::Io(e) => Error::Connection {
                device: self.device.to_string(),
                message: e.to_string(),
            },
            other => other,
        }
    }

    fn unexpected(&self, response: Response) -> Error {
        Error::Device {
            device: self.device.to_string(),
            message: format!("unexpected response {:?}", response),
        }
    }

    async fn call_ok(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn call_entry(&self, request: Request) -> Result<Option<Entry>> {
        match self.call(request).await? {
            Response::Entry { entry } => Ok(entry),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl DeviceConnection for TcpConnection {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.call_entry(Request::Get { key: key.to_string() }).await
    }

    async fn get_key_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        match self
            .call(Request::GetKeyRange {
                range: range.clone(),
            })
            .await?
        {
            Response::Keys { keys } => Ok(keys),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get_previous(&self, key: &str) -> Result<Option<Entry>> {
        self.call_entry(Request::GetPrevious { key: key.to_string() })
            .await
    }

    async fn put(&self, key: &str, value: Bytes, sync: Synchronization) -> Result<()> {
        self.call_ok(Request::Put {
            key: key.to_string(),
            value,
            sync,
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.call_ok(Request::Delete { key: key.to_string() }).await
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        self.call_ok(Request::DeleteKeys {
            keys: keys.to_vec(),
        })
        .await
    }

    async fn push_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
        self.call_ok(Request::PushKeys {
            target: target.clone(),
            keys: keys.to_vec(),
        })
        .await
    }

    async fn copy_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
        self.call_ok(Request::CopyKeys {
            target: target.clone(),
            keys: keys.to_vec(),
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.broken.store(true, Ordering::Release);
        let mut transport = self.transport.lock().await;
        SinkExt::<Bytes>::close(&mut *transport)
            .await
            .map_err(|e| self.classify(Error::Io(e)))
    }
}

/// Opens [`TcpConnection`]s, retrying up to `connect_retry` times.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        device: &DeviceId,
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn DeviceConnection>> {
        let (host, port) = device.host_port()?;
        let attempts = settings.connect_retry.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match timeout(settings.connect_timeout, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!(device = %device, attempt, "Connected to device");
                    return Ok(Arc::new(TcpConnection {
                        device: device.clone(),
                        transport: Mutex::new(framed(stream)),
                        response_timeout: settings.response_timeout,
                        broken: AtomicBool::new(false),
                    }));
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    last_err = Some(Error::ConnectionRefused {
                        device: device.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    last_err = Some(Error::Connection {
                        device: device.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    last_err = Some(Error::Timeout {
                        device: device.to_string(),
                        operation: "connect".to_string(),
                        timeout_secs: settings.connect_timeout.as_secs(),
                    });
                }
            }
            if attempt < attempts {
                warn!(device = %device, attempt, "Connect attempt failed, retrying");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Connection {
            device: device.to_string(),
            message: "no connect attempt made".to_string(),
        }))
    }
}

// =============================================================================
// Device emulator
// =============================================================================

/// Serve `device` from `cluster` on `listener` until `shutdown` fires.
pub async fn serve_device(
    listener: TcpListener,
    cluster: InMemoryCluster,
    device: DeviceId,
    shutdown: CancellationToken,
) -> Result<()> {
    if cluster.device(&device).is_none() {
        return Err(Error::Config(format!("device {} is not in the cluster", device)));
    }
    info!(device = %device, addr = ?listener.local_addr().ok(), "Device emulator listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let cluster = cluster.clone();
        let device = device.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, cluster, &device, shutdown).await {
                debug!(device = %device, peer = %peer, error = %e, "Client session ended");
            }
        });
    }

    info!(device = %device, "Device emulator stopped");
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    cluster: InMemoryCluster,
    device: &DeviceId,
    shutdown: CancellationToken,
) -> Result<()> {
    let conn = cluster.connection(device)?;
    let mut transport = framed(stream);
    loop {
        let request: Request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = recv_message(&mut transport) => match frame {
                Ok(request) => request,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        let response = dispatch(&conn, request).await;
        send_message(&mut transport, &response).await?;
    }
}

async fn dispatch(conn: &dyn DeviceConnection, request: Request) -> Response {
    let result = match request {
        Request::Get { key } => conn.get(&key).await.map(|entry| Response::Entry { entry }),
        Request::GetPrevious { key } => conn
            .get_previous(&key)
            .await
            .map(|entry| Response::Entry { entry }),
        Request::GetKeyRange { range } => conn
            .get_key_range(&range)
            .await
            .map(|keys| Response::Keys { keys }),
        Request::Put { key, value, sync } => {
            conn.put(&key, value, sync).await.map(|_| Response::Ok)
        }
        Request::Delete { key } => conn.delete(&key).await.map(|_| Response::Ok),
        Request::DeleteKeys { keys } => conn.delete_keys(&keys).await.map(|_| Response::Ok),
        Request::PushKeys { target, keys } => {
            conn.push_keys(&target, &keys).await.map(|_| Response::Ok)
        }
        Request::CopyKeys { target, keys } => {
            conn.copy_keys(&target, &keys).await.map(|_| Response::Ok)
        }
    };
    result.unwrap_or_else(|e| Response::Error {
        refused: e.is_connection_refused(),
        message: e.to_string(),
    })
}
