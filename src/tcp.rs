//! A transport on top of tokio's TCP sockets, implementing the endpoint contract.
//!
//! Each connection has a single tokio task owning the socket. It reads and posts the received
//!  bytes to the scheduler as handler upcalls, and it writes buffers queued by `send()`. Handler
//!  code runs on the scheduler, never on the connection task, so a handler may block on
//!  `run_pending_io` without stalling socket I/O.
//!
//! The connection task holds an endpoint reference for as long as it runs, and every posted
//!  upcall holds one until it has run. When the task terminates (peer closed, I/O error, handler
//!  refused data, or `close()`), it posts `on_connection_closed` and releases its own reference.
//!  The endpoint is destroyed when the last of these references is gone.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::context::{ConnectionContext, ContextOwner, ContextPool, ContextView};
use crate::endpoint::{CloseOutcome, EndpointGuard, EndpointLifetime, EndpointRef, EndpointState, ReleaseOutcome, ServiceEndpoint};
use crate::format::ShortContext;
use crate::handler::{ProtocolHandler, ProtocolHandlerFactory};
use crate::scheduler::{IoScheduler, SchedulerHandle};
use crate::{cc_debug, cc_trace};


/// State shared between the transport and its endpoints, needed when an endpoint is destroyed.
struct TransportShared {
    context_pool: ContextPool,
    connections: Mutex<FxHashMap<Uuid, Arc<TcpEndpoint>>>,
    all_closed: Notify,
}

impl TransportShared {
    fn register(&self, id: Uuid, endpoint: Arc<TcpEndpoint>) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(id, endpoint);
        }
    }

    fn unregister(&self, id: Uuid) {
        let Ok(mut connections) = self.connections.lock() else {
            return;
        };
        connections.remove(&id);
        if connections.is_empty() {
            self.all_closed.notify_waiters();
        }
    }

    fn snapshot(&self) -> Vec<Arc<TcpEndpoint>> {
        self.connections.lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    fn num_connections(&self) -> usize {
        self.connections.lock()
            .map(|c| c.len())
            .unwrap_or(0)
    }
}


pub struct TcpTransport {
    config: Arc<TransportConfig>,
    scheduler: Arc<IoScheduler>,
    handler_factory: Arc<dyn ProtocolHandlerFactory>,
    shared: Arc<TransportShared>,
    cancel_sender: broadcast::Sender<()>,
}

impl Debug for TcpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpTransport{{listen_addr:{:?}}}", self.config.listen_addr)
    }
}

impl TcpTransport {
    pub fn new(config: TransportConfig, handler_factory: Arc<dyn ProtocolHandlerFactory>) -> anyhow::Result<TcpTransport> {
        config.validate()?;

        let (cancel_sender, _) = broadcast::channel(1);
        let shared = Arc::new(TransportShared {
            context_pool: ContextPool::new(config.context_pool_size),
            connections: Default::default(),
            all_closed: Notify::new(),
        });

        Ok(TcpTransport {
            config: Arc::new(config),
            scheduler: IoScheduler::new(),
            handler_factory,
            shared,
            cancel_sender,
        })
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Starts the configured number of tasks executing scheduled work. Without them, scheduled
    ///  work only runs through `run_pending_io`.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.scheduler_workers)
            .map(|_| {
                let scheduler = self.scheduler.clone();
                tokio::spawn(async move { scheduler.run_loop().await })
            })
            .collect()
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("bound listener to {:?}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn accept_loop(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting accept loop");

        loop {
            tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, from)) => {
                            self.spawn_connection(stream, from, true);
                        }
                        Err(e) => {
                            warn!(error = ?e, "error accepting connection");
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        info!("accept loop terminated");
        Ok(())
    }

    pub fn cancel_accept_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            debug!(?err, "no accept loop to cancel");
        }
    }

    pub async fn connect(&self, to: SocketAddr) -> anyhow::Result<EndpointRef> {
        debug!("connecting to {:?}", to);
        let stream = TcpStream::connect(to).await?;
        Ok(self.spawn_connection(stream, to, false))
    }

    pub fn num_connections(&self) -> usize {
        self.shared.num_connections()
    }

    pub fn num_pooled_contexts(&self) -> usize {
        self.shared.context_pool.num_pooled()
    }

    pub fn close_all(&self) {
        for endpoint in self.shared.snapshot() {
            endpoint.close();
        }
    }

    /// Stops accepting, closes all connections and waits up to `grace` for them to be destroyed
    ///  before stopping the scheduler. Upcalls still pending at that point are discarded.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_accept_loop();
        self.close_all();

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.shared.all_closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.num_connections() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("{} connections still open after grace period", self.num_connections());
                break;
            }
        }

        self.scheduler.shutdown();
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr, is_incoming: bool) -> EndpointRef {
        let ctx = ConnectionContext::from_socket_addr(Uuid::new_v4(), peer_addr, is_incoming);
        let context_owner = self.shared.context_pool.get_from_pool(&ctx);
        let context = context_owner.view();
        let (outbound, outbound_rx) = mpsc::channel(self.config.send_queue_capacity);

        let endpoint = Arc::new_cyclic(|self_ref| TcpEndpoint {
            self_ref: self_ref.clone(),
            connection_id: ctx.connection_id(),
            lifetime: EndpointLifetime::new(),
            context: context.clone(),
            context_owner: Mutex::new(Some(context_owner)),
            scheduler: self.scheduler.handle(),
            outbound,
            close_requested: Notify::new(),
            discard_received: AtomicBool::new(false),
            handler: Mutex::new(None),
            transport: Arc::downgrade(&self.shared),
        });
        let endpoint_ref = EndpointRef::new(endpoint.clone());

        let Some(connection_guard) = endpoint_ref.acquire() else {
            error!("newly created endpoint for {:?} is already destroyed", ctx);
            return endpoint_ref;
        };

        let handler = self.handler_factory.create(context, endpoint_ref.clone());
        endpoint.set_handler(handler);
        self.shared.register(ctx.connection_id(), endpoint.clone());

        cc_debug!(ctx, "connection established");

        let span = span!(Level::DEBUG, "connection", ctx = %ShortContext(&ctx));
        tokio::spawn(
            run_connection(endpoint, stream, outbound_rx, connection_guard, self.config.clone())
                .instrument(span)
        );

        endpoint_ref
    }
}


/// The per-connection endpoint. Protocol code only sees it through [EndpointRef]s.
pub struct TcpEndpoint {
    self_ref: Weak<TcpEndpoint>,
    connection_id: Uuid,
    lifetime: EndpointLifetime,
    context: ContextView,
    /// taken and returned to the pool on destruction
    context_owner: Mutex<Option<ContextOwner>>,
    scheduler: SchedulerHandle,
    outbound: mpsc::Sender<Bytes>,
    close_requested: Notify,
    /// set when protocol code closed the connection, received data still pending is dropped then
    discard_received: AtomicBool,
    /// dropped on destruction, breaking the endpoint / handler reference cycle
    handler: Mutex<Option<Arc<dyn ProtocolHandler>>>,
    transport: Weak<TransportShared>,
}

impl Debug for TcpEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpEndpoint{{{:?}: {:?}}}", self.context, self.lifetime)
    }
}

impl TcpEndpoint {
    pub fn state(&self) -> EndpointState {
        self.lifetime.state()
    }

    pub fn context(&self) -> ContextView {
        self.context.clone()
    }

    fn set_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        if let Ok(mut h) = self.handler.lock() {
            *h = Some(handler);
        }
    }

    fn handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.handler.lock().ok()?.clone()
    }

    fn acquire(&self) -> Option<EndpointGuard> {
        let endpoint: Arc<dyn ServiceEndpoint> = self.self_ref.upgrade()?;
        EndpointRef::new(endpoint).acquire()
    }

    /// Posts an upcall to the handler. The job owns `guard`, so the endpoint outlives the job.
    fn post_upcall(&self, guard: EndpointGuard, upcall: impl FnOnce(&dyn ProtocolHandler) + Send + 'static) -> bool {
        let Some(handler) = self.handler() else {
            return false;
        };

        self.scheduler.post(move || {
            upcall(handler.as_ref());
            drop(guard);
        })
    }

    /// `discard_received` is false when the connection went down on its own (EOF, I/O error): data
    ///  received up to that point is still delivered.
    fn request_close(&self, discard_received: bool) -> bool {
        match self.lifetime.close() {
            CloseOutcome::AlreadyClosed => false,
            CloseOutcome::Closing => {
                if discard_received {
                    self.discard_received.store(true, Ordering::Release);
                }
                self.close_requested.notify_one();
                true
            }
            CloseOutcome::Destroy => {
                self.close_requested.notify_one();
                self.destroy();
                true
            }
        }
    }

    fn destroy(&self) {
        let ctx = self.context.load();
        cc_debug!(ctx, "destroying endpoint");

        let handler = self.handler.lock().ok().and_then(|mut h| h.take());
        drop(handler);

        let context_owner = self.context_owner.lock().ok().and_then(|mut o| o.take());
        if let Some(transport) = self.transport.upgrade() {
            if let Some(owner) = context_owner {
                transport.context_pool.return_to_pool(owner);
            }
            transport.unregister(self.connection_id);
        }
    }
}

impl ServiceEndpoint for TcpEndpoint {
    fn send(&self, buf: &[u8]) -> bool {
        if !self.lifetime.is_active() {
            trace!("endpoint is not active, not sending");
            return false;
        }

        match self.outbound.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("send queue is full, dropping {} bytes", buf.len());
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("connection task terminated, dropping {} bytes", buf.len());
                false
            }
        }
    }

    fn close(&self) -> bool {
        self.request_close(true)
    }

    fn run_pending_io(&self) -> bool {
        self.lifetime.is_active() && self.scheduler.run_once()
    }

    fn request_callback(&self) -> bool {
        if !self.lifetime.is_active() {
            return false;
        }
        let Some(guard) = self.acquire() else {
            return false;
        };
        self.post_upcall(guard, |h| h.on_callback())
    }

    fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    fn add_ref(&self) -> bool {
        self.lifetime.add_ref()
    }

    fn release(&self) -> bool {
        match self.lifetime.release() {
            ReleaseOutcome::Unbalanced => {
                warn!("unbalanced release on {:?}", self);
                false
            }
            ReleaseOutcome::Alive => true,
            ReleaseOutcome::Destroy => {
                self.destroy();
                true
            }
        }
    }
}


async fn run_connection(
    endpoint: Arc<TcpEndpoint>,
    stream: TcpStream,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    guard: EndpointGuard,
    config: Arc<TransportConfig>,
) {
    let ctx = endpoint.context.load();
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; config.read_buffer_size];
    let mut timer = config.timer_interval
        .map(|interval| tokio::time::interval_at(Instant::now() + interval, interval));

    endpoint.post_upcall(guard.clone(), |h| h.on_connection_opened());

    loop {
        tokio::select! {
            r = reader.read(&mut buf) => {
                match r {
                    Ok(0) => {
                        cc_debug!(ctx, "connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        cc_trace!(ctx, "received {} bytes", n);
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        let ep = endpoint.clone();
                        let posted = endpoint.post_upcall(guard.clone(), move |h| {
                            if ep.discard_received.load(Ordering::Acquire) {
                                trace!("endpoint was closed, discarding {} received bytes", data.len());
                                return;
                            }
                            if !h.on_bytes_received(&data) {
                                debug!("protocol handler refused data, closing connection");
                                ep.close();
                            }
                        });
                        if !posted {
                            cc_debug!(ctx, "scheduler rejected delivery, terminating connection");
                            break;
                        }
                    }
                    Err(e) => {
                        cc_debug!(ctx, "error reading from socket: {}", e);
                        break;
                    }
                }
            }
            msg = outbound_rx.recv() => {
                match msg {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            cc_debug!(ctx, "error writing to socket: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = endpoint.close_requested.notified() => {
                cc_debug!(ctx, "close requested");
                break;
            }
            _ = tick(&mut timer) => {
                if endpoint.lifetime.is_active() {
                    endpoint.post_upcall(guard.clone(), |h| h.on_timer());
                }
            }
        }
    }

    // sends fail from here on, anything that made it into the queue is still written
    outbound_rx.close();
    // the connection may have gone down without anybody calling close()
    endpoint.request_close(false);
    flush_queued(&mut outbound_rx, &mut writer).await;

    if let Err(e) = writer.shutdown().await {
        trace!("error shutting down socket: {}", e);
    }
    drop(writer);
    drop(reader);

    let job_guard = guard.clone();
    if !endpoint.post_upcall(job_guard, |h| h.on_connection_closed()) {
        match endpoint.handler() {
            Some(handler) => handler.on_connection_closed(),
            None => error!("no handler to notify of closed connection"),
        }
    }
    drop(guard);
}

async fn flush_queued(outbound_rx: &mut mpsc::Receiver<Bytes>, writer: &mut OwnedWriteHalf) {
    while let Ok(data) = outbound_rx.try_recv() {
        if let Err(e) = writer.write_all(&data).await {
            debug!("error flushing queued data: {}", e);
            return;
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => { timer.tick().await; }
        None => std::future::pending().await,
    }
}
