//! TCP transport: newline-delimited JSON request/response.
//!
//! Each request is one JSON object on one line; each response is one JSON
//! object on one line. A connection carries any number of sequential calls.
//!
//! ```text
//! observer                          partition / registry
//!   |-- {"op":"step_counter"}\n ------->|
//!   |<------- {"type":"step","value":42}\n
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::endpoint::{Directory, PartitionEndpoint};
use crate::error::EnvError;
use crate::types::{FieldStorage, IntRect2D, StatRecord};

/// Default per-call transport timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// A call sent to a partition or to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    StepCounter,
    Time,
    WorldBounds,
    PartitionCount,
    LocalBounds,
    AllLocalBounds,
    Lock,
    Unlock,
    FieldStorage { index: usize },
    StatBatch,
    Lookup { name: String },
}

/// The answer to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RpcResponse {
    Step(u64),
    Time(f64),
    Bounds(IntRect2D),
    Count(usize),
    BoundsList(Vec<IntRect2D>),
    Done,
    Storage(FieldStorage),
    Stats(Vec<StatRecord>),
    Address(String),
    Error(EnvError),
}

fn unexpected(response: RpcResponse) -> EnvError {
    EnvError::SerializationError(format!("unexpected response: {:?}", response))
}

/// One open line-oriented connection.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, EnvError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| EnvError::unreachable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            line: String::new(),
        })
    }

    async fn roundtrip(&mut self, request: &RpcRequest) -> Result<RpcResponse, EnvError> {
        let mut bytes = serde_json::to_vec(request)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;

        self.line.clear();
        let read = self.reader.read_line(&mut self.line).await?;
        if read == 0 {
            return Err(EnvError::network("connection closed by peer"));
        }
        Ok(serde_json::from_str(self.line.trim_end())?)
    }
}

/// Client handle to a partition served by [`serve_endpoint`].
///
/// Holds one connection, reopened lazily after a transport failure.
/// Calls are serialized on that connection.
pub struct TcpEndpoint {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl TcpEndpoint {
    /// Connects eagerly so that an unreachable endpoint fails at lookup.
    pub async fn connect(addr: impl Into<String>, timeout: Duration) -> Result<Self, EnvError> {
        let addr = addr.into();
        let conn = tokio::time::timeout(timeout, Connection::open(&addr))
            .await
            .map_err(|_| EnvError::Timeout(timeout.as_millis() as u64))??;
        Ok(Self {
            addr,
            timeout,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Address of the remote partition.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, EnvError> {
        let mut guard = self.conn.lock().await;
        let timeout_ms = self.timeout.as_millis() as u64;

        let result = tokio::time::timeout(self.timeout, async {
            if guard.is_none() {
                *guard = Some(Connection::open(&self.addr).await?);
            }
            let conn = guard
                .as_mut()
                .ok_or_else(|| EnvError::network("connection unavailable"))?;
            conn.roundtrip(&request).await
        })
        .await
        .unwrap_or(Err(EnvError::Timeout(timeout_ms)));

        match result {
            Ok(RpcResponse::Error(err)) => Err(err),
            Ok(response) => Ok(response),
            Err(err) => {
                // The stream may hold a half-read response; never reuse it.
                *guard = None;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl PartitionEndpoint for TcpEndpoint {
    async fn step_counter(&self) -> Result<u64, EnvError> {
        match self.call(RpcRequest::StepCounter).await? {
            RpcResponse::Step(step) => Ok(step),
            other => Err(unexpected(other)),
        }
    }

    async fn time(&self) -> Result<f64, EnvError> {
        match self.call(RpcRequest::Time).await? {
            RpcResponse::Time(time) => Ok(time),
            other => Err(unexpected(other)),
        }
    }

    async fn world_bounds(&self) -> Result<IntRect2D, EnvError> {
        match self.call(RpcRequest::WorldBounds).await? {
            RpcResponse::Bounds(bounds) => Ok(bounds),
            other => Err(unexpected(other)),
        }
    }

    async fn partition_count(&self) -> Result<usize, EnvError> {
        match self.call(RpcRequest::PartitionCount).await? {
            RpcResponse::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    async fn local_bounds(&self) -> Result<IntRect2D, EnvError> {
        match self.call(RpcRequest::LocalBounds).await? {
            RpcResponse::Bounds(bounds) => Ok(bounds),
            other => Err(unexpected(other)),
        }
    }

    async fn all_local_bounds(&self) -> Result<Vec<IntRect2D>, EnvError> {
        match self.call(RpcRequest::AllLocalBounds).await? {
            RpcResponse::BoundsList(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    async fn lock(&self) -> Result<(), EnvError> {
        match self.call(RpcRequest::Lock).await? {
            RpcResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn unlock(&self) -> Result<(), EnvError> {
        match self.call(RpcRequest::Unlock).await? {
            RpcResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn field_storage(&self, index: usize) -> Result<FieldStorage, EnvError> {
        match self.call(RpcRequest::FieldStorage { index }).await? {
            RpcResponse::Storage(storage) => Ok(storage),
            other => Err(unexpected(other)),
        }
    }

    async fn stat_batch(&self) -> Result<Vec<StatRecord>, EnvError> {
        match self.call(RpcRequest::StatBatch).await? {
            RpcResponse::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

/// Directory client talking to a registry served by [`serve_registry`].
pub struct TcpDirectory {
    registry_addr: String,
    timeout: Duration,
}

impl TcpDirectory {
    pub fn new(registry_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            registry_addr: registry_addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Directory for TcpDirectory {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn PartitionEndpoint>, EnvError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let request = RpcRequest::Lookup {
            name: name.to_string(),
        };

        let response = tokio::time::timeout(self.timeout, async {
            let mut conn = Connection::open(&self.registry_addr).await?;
            conn.roundtrip(&request).await
        })
        .await
        .unwrap_or(Err(EnvError::Timeout(timeout_ms)))?;

        let addr = match response {
            RpcResponse::Address(addr) => addr,
            RpcResponse::Error(err) => return Err(err),
            other => return Err(unexpected(other)),
        };

        debug!(name, %addr, "resolved partition endpoint");
        let endpoint = TcpEndpoint::connect(addr, self.timeout).await?;
        Ok(Arc::new(endpoint))
    }
}

/// What a listener serves.
#[derive(Clone)]
enum Service {
    Endpoint(Arc<dyn PartitionEndpoint>),
    Registry(Arc<HashMap<String, SocketAddr>>),
}

impl Service {
    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        match self {
            Service::Endpoint(endpoint) => dispatch_endpoint(endpoint.as_ref(), request).await,
            Service::Registry(bindings) => match request {
                RpcRequest::Lookup { name } => match bindings.get(&name) {
                    Some(addr) => RpcResponse::Address(addr.to_string()),
                    None => RpcResponse::Error(EnvError::NotBound(name)),
                },
                other => RpcResponse::Error(EnvError::remote(format!(
                    "registry does not serve {:?}",
                    other
                ))),
            },
        }
    }
}

async fn dispatch_endpoint(endpoint: &dyn PartitionEndpoint, request: RpcRequest) -> RpcResponse {
    let result = match request {
        RpcRequest::StepCounter => endpoint.step_counter().await.map(RpcResponse::Step),
        RpcRequest::Time => endpoint.time().await.map(RpcResponse::Time),
        RpcRequest::WorldBounds => endpoint.world_bounds().await.map(RpcResponse::Bounds),
        RpcRequest::PartitionCount => endpoint.partition_count().await.map(RpcResponse::Count),
        RpcRequest::LocalBounds => endpoint.local_bounds().await.map(RpcResponse::Bounds),
        RpcRequest::AllLocalBounds => endpoint
            .all_local_bounds()
            .await
            .map(RpcResponse::BoundsList),
        RpcRequest::Lock => endpoint.lock().await.map(|_| RpcResponse::Done),
        RpcRequest::Unlock => endpoint.unlock().await.map(|_| RpcResponse::Done),
        RpcRequest::FieldStorage { index } => endpoint
            .field_storage(index)
            .await
            .map(RpcResponse::Storage),
        RpcRequest::StatBatch => endpoint.stat_batch().await.map(RpcResponse::Stats),
        RpcRequest::Lookup { name } => Err(EnvError::remote(format!(
            "partition endpoint cannot resolve {name}"
        ))),
    };
    result.unwrap_or_else(RpcResponse::Error)
}

async fn handle_client(stream: TcpStream, service: Service) -> Result<(), EnvError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(trimmed) {
            Ok(request) => service.dispatch(request).await,
            Err(err) => {
                warn!("Invalid request: {}", trimmed);
                RpcResponse::Error(EnvError::from(err))
            }
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        write.write_all(&bytes).await?;
    }
}

async fn serve(listener: TcpListener, service: Service) -> Result<(), EnvError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "client connected");
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, service).await {
                debug!(%peer, "client dropped: {}", err);
            }
        });
    }
}

/// Serves one partition endpoint on `listener` until the listener fails.
pub async fn serve_endpoint(
    listener: TcpListener,
    endpoint: Arc<dyn PartitionEndpoint>,
) -> Result<(), EnvError> {
    info!(addr = ?listener.local_addr().ok(), "serving partition endpoint");
    serve(listener, Service::Endpoint(endpoint)).await
}

/// Serves a name registry mapping canonical partition names to addresses.
pub async fn serve_registry(
    listener: TcpListener,
    bindings: HashMap<String, SocketAddr>,
) -> Result<(), EnvError> {
    info!(
        addr = ?listener.local_addr().ok(),
        names = bindings.len(),
        "serving registry"
    );
    serve(listener, Service::Registry(Arc::new(bindings))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{partition_name, PartitionId, StoragePayload};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedEndpoint {
        locked: AtomicBool,
    }

    #[async_trait]
    impl PartitionEndpoint for FixedEndpoint {
        async fn step_counter(&self) -> Result<u64, EnvError> {
            Ok(42)
        }
        async fn time(&self) -> Result<f64, EnvError> {
            Ok(4.2)
        }
        async fn world_bounds(&self) -> Result<IntRect2D, EnvError> {
            Ok(IntRect2D::with_size(100, 50))
        }
        async fn partition_count(&self) -> Result<usize, EnvError> {
            Ok(1)
        }
        async fn local_bounds(&self) -> Result<IntRect2D, EnvError> {
            Ok(IntRect2D::with_size(100, 50))
        }
        async fn all_local_bounds(&self) -> Result<Vec<IntRect2D>, EnvError> {
            Ok(vec![IntRect2D::with_size(100, 50)])
        }
        async fn lock(&self) -> Result<(), EnvError> {
            self.locked.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn unlock(&self) -> Result<(), EnvError> {
            self.locked.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn field_storage(&self, index: usize) -> Result<FieldStorage, EnvError> {
            if index > 0 {
                return Err(EnvError::BadStorageIndex {
                    index,
                    available: 1,
                });
            }
            Ok(FieldStorage::new(
                IntRect2D::with_size(2, 1),
                42,
                StoragePayload::DoubleGrid(vec![1.0, 2.0]),
            ))
        }
        async fn stat_batch(&self) -> Result<Vec<StatRecord>, EnvError> {
            Ok(vec![StatRecord::new(41, "a"), StatRecord::new(42, "b")])
        }
    }

    async fn spawn_cluster() -> (String, Arc<FixedEndpoint>) {
        let endpoint = Arc::new(FixedEndpoint {
            locked: AtomicBool::new(false),
        });
        let ep_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep_addr = ep_listener.local_addr().unwrap();
        tokio::spawn(serve_endpoint(ep_listener, endpoint.clone()));

        let reg_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reg_addr = reg_listener.local_addr().unwrap();
        let mut bindings = HashMap::new();
        bindings.insert(partition_name(PartitionId(0)), ep_addr);
        tokio::spawn(serve_registry(reg_listener, bindings));

        (reg_addr.to_string(), endpoint)
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&RpcRequest::FieldStorage { index: 3 }).unwrap();
        assert_eq!(json, r#"{"op":"field_storage","index":3}"#);
        let json = serde_json::to_string(&RpcResponse::Step(9)).unwrap();
        assert_eq!(json, r#"{"type":"step","value":9}"#);
    }

    #[tokio::test]
    async fn test_lookup_and_calls_over_tcp() {
        let (registry, remote) = spawn_cluster().await;
        let directory = TcpDirectory::new(registry, DEFAULT_CALL_TIMEOUT);

        let endpoint = directory.lookup("partition-0").await.unwrap();
        assert_eq!(endpoint.step_counter().await.unwrap(), 42);
        assert_eq!(endpoint.partition_count().await.unwrap(), 1);
        assert_eq!(endpoint.world_bounds().await.unwrap().width(), 100);

        endpoint.lock().await.unwrap();
        assert!(remote.locked.load(Ordering::SeqCst));
        let storage = endpoint.field_storage(0).await.unwrap();
        assert_eq!(storage.payload, StoragePayload::DoubleGrid(vec![1.0, 2.0]));
        endpoint.unlock().await.unwrap();
        assert!(!remote.locked.load(Ordering::SeqCst));

        let stats = endpoint.stat_batch().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].render(), "b");
    }

    #[tokio::test]
    async fn test_remote_errors_cross_the_wire() {
        let (registry, _remote) = spawn_cluster().await;
        let directory = TcpDirectory::new(registry, DEFAULT_CALL_TIMEOUT);

        let err = directory.lookup("partition-9").await.err().unwrap();
        assert_eq!(err, EnvError::NotBound("partition-9".to_string()));

        let endpoint = directory.lookup("partition-0").await.unwrap();
        let err = endpoint.field_storage(5).await.unwrap_err();
        assert_eq!(
            err,
            EnvError::BadStorageIndex {
                index: 5,
                available: 1
            }
        );
        // The connection is still usable after a logical error.
        assert_eq!(endpoint.step_counter().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let directory = TcpDirectory::new(addr.to_string(), Duration::from_millis(500));
        let err = directory.lookup("partition-0").await.err().unwrap();
        assert!(err.is_transport());
    }
}
