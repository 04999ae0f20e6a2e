//! Bidirectional framed connection over any async byte stream.
//!
//! The write half is owned by a background writer task fed through an mpsc
//! channel, so callers and handler tasks never contend on the stream. The
//! read half is owned by a reader task that reassembles frames, routes
//! replies to pending calls (by request id) and dispatches requests to the
//! [`MethodRegistry`].
//!
//! When the stream ends, fails, or carries an undecodable frame, every
//! pending call fails with [`IpcError::ConnectionLost`] and the registered
//! finalizers run once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::IpcError;
use crate::frame::{encode_frame, FrameBuffer};
use crate::message::{Frame, LogRecord, RecordLevel, ReplyFrame, ReplyOutcome, RequestFrame};
use crate::registry::MethodRegistry;

/// Commands for the background writer task.
enum WriterCommand {
    Frame(Bytes),
    /// Flush everything queued so far, then shut the write half down.
    Close,
}

type PendingMap = HashMap<Uuid, oneshot::Sender<Result<Bytes, IpcError>>>;

struct ConnectionInner {
    name: String,
    send_tx: mpsc::Sender<WriterCommand>,
    pending: Mutex<PendingMap>,
    finalizers: Mutex<Vec<BoxFuture<'static, ()>>>,
    lost: AtomicBool,
    closed_tx: watch::Sender<bool>,
    stop_reading: Notify,
    /// Inbound requests whose reply has not been queued yet.
    inbound_in_flight: AtomicUsize,
    inbound_done: Notify,
}

/// Cheaply clonable handle on one framed connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("lost", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start serving `registry` over the given stream halves.
    pub fn spawn<R, W>(name: impl Into<String>, reader: R, writer: W, registry: MethodRegistry) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (send_tx, send_rx) = mpsc::channel::<WriterCommand>(256);
        let (closed_tx, _) = watch::channel(false);

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                name: name.clone(),
                send_tx,
                pending: Mutex::new(HashMap::new()),
                finalizers: Mutex::new(Vec::new()),
                lost: AtomicBool::new(false),
                closed_tx,
                stop_reading: Notify::new(),
                inbound_in_flight: AtomicUsize::new(0),
                inbound_done: Notify::new(),
            }),
        };

        debug!(connection = %name, "starting framed connection");
        tokio::spawn(Self::write_loop(writer, send_rx, Arc::downgrade(&conn.inner)));
        tokio::spawn(Self::read_loop(reader, conn.clone(), registry));
        conn
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ── Background tasks ─────────────────────────────────────────────

    async fn write_loop<W>(mut writer: W, mut send_rx: mpsc::Receiver<WriterCommand>, inner: Weak<ConnectionInner>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(cmd) = send_rx.recv().await {
            match cmd {
                WriterCommand::Frame(bytes) => {
                    let written = async {
                        writer.write_all(&bytes).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        warn!(error = %e, "frame write failed");
                        if let Some(inner) = inner.upgrade() {
                            inner.stop_reading.notify_one();
                        }
                        break;
                    }
                }
                WriterCommand::Close => {
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "write half shutdown failed");
                    }
                    break;
                }
            }
        }
        trace!("writer loop ended");
    }

    async fn read_loop<R>(mut reader: R, conn: Connection, registry: MethodRegistry)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut buffer = FrameBuffer::new();
        'read: loop {
            let read = tokio::select! {
                result = reader.read_buf(buffer.read_target()) => result,
                _ = conn.inner.stop_reading.notified() => break 'read,
            };
            match read {
                Ok(0) => {
                    debug!(connection = %conn.inner.name, "peer closed the stream");
                    break 'read;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(connection = %conn.inner.name, error = %e, "read failed");
                    break 'read;
                }
            }

            loop {
                match buffer.next_frame() {
                    Ok(Some(payload)) => match Frame::from_bytes(&payload) {
                        Ok(frame) => conn.dispatch(frame, &registry).await,
                        Err(e) => {
                            error!(connection = %conn.inner.name, error = %e, "undecodable frame, dropping connection");
                            break 'read;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!(connection = %conn.inner.name, error = %e, "bad frame header, dropping connection");
                        break 'read;
                    }
                }
            }
        }
        conn.connection_lost().await;
    }

    async fn dispatch(&self, frame: Frame, registry: &MethodRegistry) {
        match frame {
            Frame::Request(request) => self.dispatch_request(request, registry),
            Frame::Reply(reply) => self.dispatch_reply(reply).await,
            Frame::Log(record) => self.emit_log(record),
        }
    }

    fn dispatch_request(&self, request: RequestFrame, registry: &MethodRegistry) {
        let handler = registry.get(&request.method);
        let conn = self.clone();
        let RequestFrame { id, method, arguments } = request;

        let Some(id) = id else {
            // fire-and-forget: no reply, failures only show up in the log
            tokio::spawn(async move {
                match handler {
                    Some(handler) => {
                        if let Err(e) = handler(arguments, conn.clone()).await {
                            warn!(connection = %conn.inner.name, method = %method, error = %e, "notification handler failed");
                        }
                    }
                    None => warn!(connection = %conn.inner.name, method = %method, "notification for unknown method"),
                }
            });
            return;
        };

        self.inner.inbound_in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => match handler(arguments, conn.clone()).await {
                    Ok(value) => ReplyOutcome::Ok(value),
                    Err(message) => ReplyOutcome::Err(message),
                },
                None => ReplyOutcome::Err(format!("unknown method '{method}'")),
            };
            if let Err(e) = conn.send_frame(&Frame::Reply(ReplyFrame { id, outcome })).await {
                debug!(connection = %conn.inner.name, method = %method, error = %e, "could not send reply");
            }
            if conn.inner.inbound_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                conn.inner.inbound_done.notify_waiters();
            }
        });
    }

    async fn dispatch_reply(&self, reply: ReplyFrame) {
        let waiter = self.inner.pending.lock().await.remove(&reply.id);
        match waiter {
            Some(tx) => {
                let result = match reply.outcome {
                    ReplyOutcome::Ok(value) => Ok(value),
                    ReplyOutcome::Err(message) => Err(IpcError::Remote(message)),
                };
                let _ = tx.send(result);
            }
            None => debug!(connection = %self.inner.name, id = %reply.id, "reply for unknown request id"),
        }
    }

    fn emit_log(&self, record: LogRecord) {
        let source = &self.inner.name;
        let logger = &record.name;
        let message = &record.message;
        match record.level {
            RecordLevel::Trace => trace!(source = %source, logger = %logger, "{message}"),
            RecordLevel::Debug => debug!(source = %source, logger = %logger, "{message}"),
            RecordLevel::Info => info!(source = %source, logger = %logger, "{message}"),
            RecordLevel::Warn => warn!(source = %source, logger = %logger, "{message}"),
            RecordLevel::Error => error!(source = %source, logger = %logger, "{message}"),
        }
    }

    async fn connection_lost(&self) {
        if self.inner.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = self.inner.pending.lock().await.drain().collect();
        let failed = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(IpcError::ConnectionLost));
        }
        let _ = self.inner.send_tx.try_send(WriterCommand::Close);

        let finalizers = std::mem::take(&mut *self.inner.finalizers.lock().await);
        for finalizer in finalizers {
            finalizer.await;
        }
        self.inner.closed_tx.send_replace(true);
        info!(connection = %self.inner.name, failed_calls = failed, "connection lost");
    }

    // ── Public API ───────────────────────────────────────────────────

    async fn send_frame(&self, frame: &Frame) -> Result<(), IpcError> {
        let payload = frame.to_bytes()?;
        let bytes = encode_frame(&payload)?;
        self.inner
            .send_tx
            .send(WriterCommand::Frame(bytes))
            .await
            .map_err(|_| IpcError::ConnectionLost)
    }

    /// Call `method` with pre-encoded arguments and wait for the reply.
    pub async fn call_raw(&self, method: &str, arguments: Bytes, timeout: Duration) -> Result<Bytes, IpcError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);
        // checked after registering, so a concurrent connection_lost either
        // drains this entry or is visible here
        if self.is_closed() {
            self.inner.pending.lock().await.remove(&id);
            return Err(IpcError::ConnectionLost);
        }

        let request = Frame::Request(RequestFrame {
            id: Some(id),
            method: method.to_string(),
            arguments,
        });
        if let Err(e) = self.send_frame(&request).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }
        trace!(connection = %self.inner.name, method = %method, id = %id, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpcError::ConnectionLost),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(IpcError::Timeout(timeout))
            }
        }
    }

    /// Call `method` and decode its return value.
    pub async fn call<A, R>(&self, method: &str, args: &A, timeout: Duration) -> Result<R, IpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arguments = Bytes::from(rmp_serde::to_vec(args)?);
        let raw = self.call_raw(method, arguments, timeout).await?;
        Ok(rmp_serde::from_slice(&raw)?)
    }

    /// Fire-and-forget request: the peer runs the handler but sends no reply.
    pub async fn notify<A: Serialize + ?Sized>(&self, method: &str, args: &A) -> Result<(), IpcError> {
        let request = Frame::Request(RequestFrame {
            id: None,
            method: method.to_string(),
            arguments: Bytes::from(rmp_serde::to_vec(args)?),
        });
        self.send_frame(&request).await
    }

    pub async fn send_log(&self, name: impl Into<String>, level: RecordLevel, message: impl Into<String>) -> Result<(), IpcError> {
        self.send_frame(&Frame::Log(LogRecord {
            name: name.into(),
            level,
            message: message.into(),
        }))
        .await
    }

    /// Run `finalizer` once the connection is lost; immediately if it already is.
    pub async fn add_finalizer<F>(&self, finalizer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut finalizers = self.inner.finalizers.lock().await;
        if self.is_closed() {
            drop(finalizers);
            finalizer.await;
            return;
        }
        finalizers.push(Box::pin(finalizer));
    }

    /// Close the write half once every inbound request has its reply queued.
    ///
    /// The connection counts as lost only when the peer closes its side too.
    pub async fn close(&self) {
        loop {
            let done = self.inner.inbound_done.notified();
            if self.inner.inbound_in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            done.await;
        }
        let _ = self.inner.send_tx.send(WriterCommand::Close).await;
    }

    /// Stop reading immediately and fail every pending call.
    pub async fn abort(&self) {
        self.inner.stop_reading.notify_one();
        self.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Wait until the connection is lost and its finalizers have run.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of outbound calls still waiting for a reply.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}
