//! Connection management.
//!
//! One TCP connection pipelines many in-flight requests. Each request is
//! tagged with a monotonically increasing sync, registered in the pending
//! table and written to the socket under the writer lock; a background
//! reader decodes response frames and routes each to its waiter by sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tntdb_protocol::codec::{Decoder, Encoder};
use tntdb_protocol::consts::{body, RequestType};
use tntdb_protocol::greeting::{scramble, Greeting, GREETING_SIZE, SCRAMBLE_SIZE};
use tntdb_protocol::Response;

use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::schema::Schema;

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A connection to the server.
///
/// Cheap to clone and safe to share across tasks: callers block only on
/// their own response. Dropping every clone aborts the background tasks.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

struct ConnectionInner {
    config: ConnectionConfig,
    /// Write half; `None` once the connection is closed.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Waiters keyed by sync tag.
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_sync: AtomicU64,
    open: AtomicBool,
    /// First terminal failure, attached to `Error::Closed`.
    terminal: Mutex<Option<String>>,
    /// Reader and keepalive handles, aborted on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    schema: RwLock<Schema>,
}

impl Connection {
    /// Connects, consumes the greeting and authenticates when the
    /// configuration carries non-anonymous credentials.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, Error> {
        if config.connect_timeout.is_zero() || config.dns_timeout.is_zero() {
            return Err(Error::Timeout);
        }
        if config.read_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Timeout);
        }

        let mut stream = open_stream(&config).await?;

        let mut raw = [0u8; GREETING_SIZE];
        read_greeting(&mut stream, config.read_timeout, &mut raw).await?;
        let greeting = Greeting::parse(&raw)?;
        tracing::info!("server greeting: {}", greeting.banner());

        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(ConnectionInner {
            config,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(HashMap::new()),
            next_sync: AtomicU64::new(1),
            open: AtomicBool::new(true),
            terminal: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            schema: RwLock::new(Schema::default()),
        });

        let reader = tokio::spawn(read_loop(Arc::downgrade(&inner), read_half));
        inner.tasks.lock().push(reader);

        if let Some(read_timeout) = inner.config.read_timeout {
            let keepalive = tokio::spawn(keepalive_loop(Arc::downgrade(&inner), read_timeout / 3));
            inner.tasks.lock().push(keepalive);
        }

        let conn = Connection { inner };
        if let Some((user, password)) = conn.inner.config.credentials() {
            if let Err(e) = conn.authenticate(user, password, greeting.salt()).await {
                conn.close().await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    async fn authenticate(
        &self,
        user: &str,
        password: &str,
        salt: &[u8; SCRAMBLE_SIZE],
    ) -> Result<(), Error> {
        let proof = scramble(salt, password);
        let request_body = [
            (body::USERNAME, Value::from(user)),
            (
                body::TUPLE,
                Value::Array(vec![
                    Value::from("chap-sha1"),
                    Value::from(proof.to_vec()),
                ]),
            ),
        ];
        self.send(RequestType::Auth, Some(&request_body)).await?;
        tracing::debug!("authenticated as {:?}", user);
        Ok(())
    }

    /// Sends a request and waits for its response.
    ///
    /// A response with an error code fails with [`Error::Server`] and
    /// leaves the connection usable.
    pub async fn send(
        &self,
        request: RequestType,
        request_body: Option<&[(u8, Value)]>,
    ) -> Result<Response, Error> {
        self.inner.send(request, request_body).await
    }

    /// Closes the connection: aborts the background tasks, shuts the
    /// socket down and fails every pending caller. Idempotent.
    pub async fn close(&self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            tracing::debug!("closing connection");
        }

        let handles: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.inner.drain_pending();
    }

    /// Returns whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the cached schema.
    pub fn schema(&self) -> Schema {
        self.inner.schema.read().clone()
    }

    pub(crate) fn read_schema<R>(&self, f: impl FnOnce(&Schema) -> R) -> R {
        f(&self.inner.schema.read())
    }

    pub(crate) fn set_schema(&self, schema: Schema) {
        *self.inner.schema.write() = schema;
    }
}

impl ConnectionInner {
    fn closed_error(&self) -> Error {
        Error::Closed(self.terminal.lock().clone())
    }

    /// Publishes a terminal failure: records the first cause, flips the
    /// open flag and fails every pending waiter.
    fn fail(&self, cause: impl Into<String>) {
        let cause = cause.into();
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::debug!("connection failed: {}", cause);
        }
        {
            let mut slot = self.terminal.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.drain_pending();
    }

    /// Dropping the senders wakes every waiter with a closed-channel
    /// error, which callers observe as [`Error::Closed`].
    fn drain_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!("failing {} pending requests", drained.len());
        }
    }

    async fn send(
        &self,
        request: RequestType,
        request_body: Option<&[(u8, Value)]>,
    ) -> Result<Response, Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        // Allocate the sync, register the waiter and write the frame under
        // the writer lock, so wire order matches sync order and the waiter
        // exists before its response can arrive.
        let (sync, rx) = {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or_else(|| self.closed_error())?;

            let sync = self.next_sync.fetch_add(1, Ordering::SeqCst);
            let frame = Encoder::encode_request(request, sync, request_body)?;

            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(sync, tx);
            tracing::debug!(
                "sending {:?} sync={} ({} bytes)",
                request,
                sync,
                frame.len()
            );

            let write = writer.write_all(&frame);
            let result = match self.config.write_timeout {
                Some(t) => match timeout(t, write).await {
                    Ok(result) => result.map_err(Error::Io),
                    Err(_) => Err(Error::Timeout),
                },
                None => write.await.map_err(Error::Io),
            };
            if let Err(e) = result {
                // A partial frame corrupts the stream for every later
                // request; the connection is done.
                self.pending.lock().remove(&sync);
                self.fail(format!("write failed: {e}"));
                return Err(e);
            }
            (sync, rx)
        };

        // The connection may have failed between the open check and the
        // pending insert; never leave a waiter a drain cannot reach.
        if !self.open.load(Ordering::SeqCst) {
            self.pending.lock().remove(&sync);
            return Err(self.closed_error());
        }

        let guard = PendingGuard {
            conn: self,
            sync,
            armed: true,
        };
        let result = rx.await;
        guard.disarm();

        match result {
            Ok(response) => {
                if response.is_error() {
                    let message = response
                        .error
                        .unwrap_or_else(|| "unknown server error".to_owned());
                    Err(Error::Server(message))
                } else {
                    Ok(response)
                }
            }
            Err(_) => Err(self.closed_error()),
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Removes the pending entry when the waiting future is cancelled, so a
/// late response is dropped silently by the reader.
struct PendingGuard<'a> {
    conn: &'a ConnectionInner,
    sync: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.pending.lock().remove(&self.sync);
        }
    }
}

async fn open_stream(config: &ConnectionConfig) -> Result<TcpStream, Error> {
    let addrs = timeout(
        config.dns_timeout,
        lookup_host((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    let mut last_err = None;
    for addr in addrs {
        match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(Error::Io(e)),
            Err(_) => last_err = Some(Error::Timeout),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "name resolved to no addresses",
        ))
    }))
}

async fn read_greeting(
    stream: &mut TcpStream,
    read_timeout: Option<Duration>,
    buf: &mut [u8; GREETING_SIZE],
) -> Result<(), Error> {
    let read = stream.read_exact(buf);
    match read_timeout {
        Some(t) => {
            timeout(t, read)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(Error::Io)?;
        }
        None => {
            read.await.map_err(Error::Io)?;
        }
    }
    Ok(())
}

/// Background reader: decodes response frames and routes each by sync.
/// Any failure is terminal for the connection.
async fn read_loop(inner: Weak<ConnectionInner>, mut read_half: OwnedReadHalf) {
    let read_timeout = match inner.upgrade() {
        Some(inner) => inner.config.read_timeout,
        None => return,
    };

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = read_half.read(&mut buf);
        let result = match read_timeout {
            Some(t) => match timeout(t, read).await {
                Ok(result) => result,
                Err(_) => {
                    fail_weak(&inner, "read timed out");
                    return;
                }
            },
            None => read.await,
        };

        let n = match result {
            Ok(0) => {
                fail_weak(&inner, "connection closed by server");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                fail_weak(&inner, format!("read failed: {e}"));
                return;
            }
        };

        let Some(inner) = inner.upgrade() else { return };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.decode_response() {
                Ok(Some(response)) => {
                    let sync = response.sync();
                    match inner.pending.lock().remove(&sync) {
                        Some(tx) => {
                            tracing::debug!("delivering response sync={}", sync);
                            let _ = tx.send(response);
                        }
                        // The caller gave up waiting.
                        None => tracing::debug!("dropping response for sync {}", sync),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    inner.fail(format!("response decode failed: {e}"));
                    return;
                }
            }
        }
    }
}

fn fail_weak(inner: &Weak<ConnectionInner>, cause: impl Into<String>) {
    if let Some(inner) = inner.upgrade() {
        inner.fail(cause);
    }
}

/// Periodic PING driven by the read timeout; doubles as a liveness probe.
async fn keepalive_loop(inner: Weak<ConnectionInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        if !inner.open.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = inner.send(RequestType::Ping, None).await {
            tracing::debug!("keepalive ping failed: {}", e);
            return;
        }
    }
}
