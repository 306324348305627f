//! Messenger
//!
//! Top-level facade of the runtime. A messenger owns a fixed set of reactors,
//! an optional acceptor, the service registry and the scheduler with its IO
//! thread pool. Every public operation enters here.
//!
//! ## Routing
//!
//! Outbound calls go to `route_to_reactor(remote, idx, n)`, a CRC32 of the
//! remote address plus the connection index modulo the reactor count. The same
//! `(remote, idx)` pair therefore always lands on the same reactor thread, which
//! is the only thread that ever touches that connection. Accepted sockets get
//! an index from a counter modulo `num_connections_to_server` and are routed
//! the same way.
//!
//! ## Lifecycle
//!
//! [`Messenger`] is a cloneable external handle. Reactor threads, the acceptor
//! thread and cancellable delayed tasks hold the shared [`MessengerInner`]
//! directly. When the last external handle is dropped the messenger shuts
//! itself down; the inner state is freed once the internal holders are gone too.

use crate::acceptor::Acceptor;
use crate::call::{ConnectionId, InboundCall, OutboundCall, RemoteMethod, RunningRpcsDump};
use crate::config::MessengerConfig;
use crate::error::ErrorCode;
use crate::frame::{encode_frame, FrameHeader};
use crate::latch::CountDownLatch;
use crate::metrics::MessengerMetrics;
use crate::reactor::{
    DelayedTask, DelayedTaskSlot, FunctorReactorTask, OutboundCallTask, Reactor, ReactorContext,
    RegisterInboundSocketTask,
};
use crate::scheduler::{IoThreadPool, ScheduledTaskId, Scheduler, TaskCallback};
use crate::service::{RpcService, ServiceRegistry};
use crate::{Result, RpcError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives event frames pushed by servers over client connections
pub type ServerEventListener = Arc<dyn Fn(SocketAddr, Bytes) + Send + Sync>;

/// Reactor index for connection `idx` to `remote`
pub fn route_to_reactor(remote: &SocketAddr, idx: usize, num_reactors: usize) -> usize {
    let mut hasher = crc32fast::Hasher::new();
    match remote.ip() {
        IpAddr::V4(ip) => hasher.update(&ip.octets()),
        IpAddr::V6(ip) => hasher.update(&ip.octets()),
    }
    hasher.update(&remote.port().to_be_bytes());
    let hash = hasher.finalize().wrapping_add(idx as u32);
    hash as usize % num_reactors.max(1)
}

/// Builder for [`Messenger`]
pub struct MessengerBuilder {
    config: MessengerConfig,
    metrics: Option<Arc<MessengerMetrics>>,
    server_event_listener: Option<ServerEventListener>,
}

impl MessengerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(MessengerConfig::with_name(name))
    }

    pub fn from_config(config: MessengerConfig) -> Self {
        Self {
            config,
            metrics: None,
            server_event_listener: None,
        }
    }

    pub fn num_reactors(mut self, num_reactors: usize) -> Self {
        self.config.num_reactors = num_reactors;
        self
    }

    /// Idle server connections close after this long; zero disables the scan
    pub fn connection_keepalive(mut self, keepalive: Duration) -> Self {
        self.config.connection_keepalive_ms = keepalive.as_millis() as u64;
        self
    }

    pub fn coarse_timer_granularity(mut self, granularity: Duration) -> Self {
        self.config.coarse_timer_granularity_ms = granularity.as_millis() as u64;
        self
    }

    pub fn io_thread_pool_size(mut self, threads: usize) -> Self {
        self.config.io_thread_pool_size = threads;
        self
    }

    pub fn num_connections_to_server(mut self, connections: usize) -> Self {
        self.config.num_connections_to_server = connections;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Share an externally owned metrics sink
    pub fn metrics(mut self, metrics: Arc<MessengerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn server_event_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(SocketAddr, Bytes) + Send + Sync + 'static,
    {
        self.server_event_listener = Some(Arc::new(listener));
        self
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Validate the configuration and start every reactor.
    ///
    /// If any reactor fails to start, the ones already running are shut down
    /// and the error is returned.
    pub fn build(self) -> Result<Messenger> {
        let inner = self.into_inner()?;
        inner.start_reactors()?;

        info!(
            messenger = %inner.name,
            reactors = inner.reactors.len(),
            "Messenger started"
        );
        Ok(Messenger {
            handle: Arc::new(ExternalHandle { inner }),
        })
    }

    fn into_inner(self) -> Result<Arc<MessengerInner>> {
        self.config.validate()?;
        let name = self.config.name.clone();

        let io_pool = IoThreadPool::new(&name, self.config.io_thread_pool_size)?;
        let scheduler = Scheduler::new(name.clone(), io_pool.handle().clone());
        let reactors = (0..self.config.num_reactors)
            .map(|idx| Reactor::new(&name, idx))
            .collect();

        Ok(Arc::new(MessengerInner {
            services: ServiceRegistry::new(name.clone()),
            name,
            reactors,
            scheduler,
            io_pool,
            metrics: self.metrics.unwrap_or_default(),
            server_event_listener: self.server_event_listener,
            state: RwLock::new(MessengerState::default()),
            has_broken_connectivity: AtomicBool::new(false),
            scheduled_tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            num_connections_accepted: AtomicUsize::new(0),
            next_connection_idx: AtomicUsize::new(0),
            shutdown_done: CountDownLatch::new(1),
            config: self.config,
        }))
    }
}

#[derive(Default)]
struct MessengerState {
    closing: bool,
    acceptor: Option<Arc<Acceptor>>,
    broken_connectivity: HashSet<IpAddr>,
    outbound_address_v4: Option<IpAddr>,
    outbound_address_v6: Option<IpAddr>,
}

/// State shared by the external handle and every internal thread
pub(crate) struct MessengerInner {
    name: String,
    config: MessengerConfig,
    reactors: Vec<Reactor>,
    services: ServiceRegistry,
    scheduler: Scheduler,
    io_pool: IoThreadPool,
    metrics: Arc<MessengerMetrics>,
    server_event_listener: Option<ServerEventListener>,
    state: RwLock<MessengerState>,
    /// Lets the hot path skip the state lock when no fault is injected
    has_broken_connectivity: AtomicBool,
    scheduled_tasks: Mutex<HashMap<ScheduledTaskId, Arc<DelayedTaskSlot>>>,
    next_task_id: AtomicU64,
    num_connections_accepted: AtomicUsize,
    next_connection_idx: AtomicUsize,
    shutdown_done: CountDownLatch,
}

impl MessengerInner {
    /// Start every reactor thread, unwinding the whole messenger on failure
    fn start_reactors(self: &Arc<Self>) -> Result<()> {
        for reactor in &self.reactors {
            if let Err(e) = reactor.init(Arc::clone(self)) {
                error!(
                    messenger = %self.name,
                    reactor = reactor.idx(),
                    error = %e,
                    "Reactor failed to start, unwinding"
                );
                self.shutdown();
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<MessengerMetrics> {
        &self.metrics
    }

    pub(crate) fn server_event_listener(&self) -> Option<&ServerEventListener> {
        self.server_event_listener.as_ref()
    }

    /// Local address outbound sockets to `remote` should bind to
    pub(crate) fn outbound_bind_address(&self, remote: &SocketAddr) -> Option<IpAddr> {
        if !self.config.bind_outbound_to_listen_address {
            return None;
        }
        let state = self.state.read();
        let local = if remote.is_ipv4() {
            state.outbound_address_v4
        } else {
            state.outbound_address_v6
        }?;
        // A loopback source cannot reach a routable peer and vice versa
        (local.is_loopback() == remote.ip().is_loopback()).then_some(local)
    }

    fn is_closing(&self) -> bool {
        self.state.read().closing
    }

    fn check_not_closing(&self) -> Result<()> {
        if self.is_closing() {
            return Err(RpcError::illegal_state(format!(
                "Messenger {} is shutting down",
                self.name
            )));
        }
        Ok(())
    }

    fn listen_address(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let acceptor = {
            let mut state = self.state.write();
            if state.closing {
                return Err(RpcError::illegal_state(format!(
                    "Messenger {} is shutting down",
                    self.name
                )));
            }
            Arc::clone(
                state
                    .acceptor
                    .get_or_insert_with(|| Arc::new(Acceptor::new(&self.name))),
            )
        };

        let bound = acceptor.listen(addr)?;

        if !bound.ip().is_unspecified() {
            let mut state = self.state.write();
            let slot = match bound.ip() {
                IpAddr::V4(_) => &mut state.outbound_address_v4,
                IpAddr::V6(_) => &mut state.outbound_address_v6,
            };
            if slot.is_none() {
                *slot = Some(bound.ip());
                debug!(messenger = %self.name, address = %bound.ip(), "Outbound address set");
            }
        }
        Ok(bound)
    }

    fn start_acceptor(self: &Arc<Self>) -> Result<()> {
        let acceptor = {
            let state = self.state.read();
            if state.closing {
                return Err(RpcError::illegal_state(format!(
                    "Messenger {} is shutting down",
                    self.name
                )));
            }
            state.acceptor.clone()
        };
        let acceptor = acceptor.ok_or_else(|| {
            RpcError::illegal_state("Trying to start acceptor without an active listen address")
        })?;
        acceptor.start(Arc::clone(self))
    }

    fn shutdown_acceptor(&self) {
        let acceptor = self.state.write().acceptor.take();
        if let Some(acceptor) = acceptor {
            acceptor.shutdown();
        }
    }

    fn register_service(&self, name: &str, service: Arc<dyn RpcService>) -> Result<()> {
        self.check_not_closing()?;
        // The registry itself rejects a registration that lost the race with shutdown
        self.services.register(name, service)
    }

    fn queue_outbound_call(&self, call: Arc<OutboundCall>) {
        call.set_queued(&self.metrics);
        let remote = call.conn_id().remote();

        if self.is_artificially_disconnected_from(remote.ip()) {
            warn!(messenger = %self.name, remote = %remote, "TEST: Rejected outbound call");
            call.transferred(RpcError::network("TEST: Connectivity is broken", Some(remote)));
            return;
        }

        let idx = route_to_reactor(&remote, call.conn_id().idx(), self.reactors.len());
        self.reactors[idx].schedule_reactor_task(Box::new(OutboundCallTask(call)));
    }

    /// Dispatch an inbound call to its service, or fail it
    pub(crate) fn queue_inbound_call(&self, call: InboundCall) {
        match self.services.lookup(call.service_name()) {
            Some(service) => service.queue_inbound_call(call),
            None => {
                let message = format!(
                    "Service {} not registered on {}",
                    call.service_name(),
                    self.name
                );
                warn!(
                    messenger = %self.name,
                    remote = %call.remote(),
                    call = %call.remote_method(),
                    "Inbound call for unknown service"
                );
                self.metrics.record_inbound_rejected();
                call.respond_failure(
                    ErrorCode::NoSuchService,
                    &RpcError::service_unavailable(message),
                );
            }
        }
    }

    pub(crate) fn register_inbound_socket(&self, stream: std::net::TcpStream, remote: SocketAddr) {
        if self.is_artificially_disconnected_from(remote.ip()) {
            warn!(messenger = %self.name, remote = %remote, "TEST: Rejected connection");
            self.metrics.record_connection_rejected();
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        self.metrics.record_connection_accepted();
        let idx = self.num_connections_accepted.fetch_add(1, Ordering::Relaxed)
            % self.config.num_connections_to_server;
        let reactor = route_to_reactor(&remote, idx, self.reactors.len());
        self.reactors[reactor]
            .schedule_reactor_task(Box::new(RegisterInboundSocketTask { stream, remote }));
    }

    /// Reactor owning the calling thread, otherwise a random one
    fn pick_reactor(&self) -> &Reactor {
        self.reactors
            .iter()
            .find(|reactor| reactor.is_current_thread())
            .unwrap_or_else(|| {
                let idx = rand::thread_rng().gen_range(0..self.reactors.len());
                &self.reactors[idx]
            })
    }

    fn schedule_on_reactor(
        self: &Arc<Self>,
        delay: Duration,
        callback: TaskCallback,
        tracked: bool,
    ) -> Option<ScheduledTaskId> {
        let slot = DelayedTaskSlot::new(callback);
        let owner = tracked.then(|| {
            let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
            self.scheduled_tasks.lock().insert(id, Arc::clone(&slot));
            (Arc::clone(self), id)
        });
        let id = owner.as_ref().map(|(_, id)| *id);

        self.pick_reactor()
            .schedule_reactor_task(Box::new(DelayedTask::new(slot, delay, owner)));
        id
    }

    fn abort_on_reactor(&self, id: ScheduledTaskId) -> bool {
        let slot = self.scheduled_tasks.lock().remove(&id);
        match slot {
            Some(slot) => slot.abort(RpcError::aborted(format!("Task {} aborted", id))),
            None => false,
        }
    }

    /// Forget a tracked task once it fired or was aborted
    pub(crate) fn remove_scheduled_task(&self, id: ScheduledTaskId) {
        self.scheduled_tasks.lock().remove(&id);
    }

    fn is_on_reactor_thread(&self) -> bool {
        self.reactors.iter().any(Reactor::is_current_thread)
    }

    fn break_connectivity_with(&self, ip: IpAddr) {
        warn!(messenger = %self.name, remote = %ip, "TEST: Break connectivity");

        let latch = {
            let mut state = self.state.write();
            if state.broken_connectivity.is_empty() {
                self.has_broken_connectivity.store(true, Ordering::Release);
            }
            if !state.broken_connectivity.insert(ip) {
                return;
            }

            let latch = Arc::new(CountDownLatch::new(self.reactors.len()));
            for reactor in &self.reactors {
                let guard = latch.guard();
                reactor.schedule_reactor_task(Box::new(FunctorReactorTask(
                    move |context: &mut ReactorContext| {
                        let _guard = guard;
                        context.drop_with_remote_address(ip);
                    },
                )));
            }
            latch
        };

        if self.is_on_reactor_thread() {
            // Our own reactor cannot run its drop task while we block
            warn!(
                messenger = %self.name,
                "TEST: Break connectivity called on a reactor thread, not waiting"
            );
            return;
        }
        latch.wait();
    }

    fn restore_connectivity_with(&self, ip: IpAddr) {
        warn!(messenger = %self.name, remote = %ip, "TEST: Restore connectivity");
        let mut state = self.state.write();
        state.broken_connectivity.remove(&ip);
        if state.broken_connectivity.is_empty() {
            self.has_broken_connectivity.store(false, Ordering::Release);
        }
    }

    fn is_artificially_disconnected_from(&self, ip: IpAddr) -> bool {
        if !self.has_broken_connectivity.load(Ordering::Acquire) {
            return false;
        }
        self.state.read().broken_connectivity.contains(&ip)
    }

    fn dump_running_rpcs(&self) -> Result<RunningRpcsDump> {
        if self.is_on_reactor_thread() {
            return Err(RpcError::illegal_state(
                "dump_running_rpcs cannot run on a reactor thread",
            ));
        }

        let latch = Arc::new(CountDownLatch::new(self.reactors.len()));
        let collected = Arc::new(Mutex::new(RunningRpcsDump::default()));
        for reactor in &self.reactors {
            let guard = latch.guard();
            let collected = Arc::clone(&collected);
            reactor.schedule_reactor_task(Box::new(FunctorReactorTask(
                move |context: &mut ReactorContext| {
                    let _guard = guard;
                    let (inbound, outbound) = context.dump();
                    let mut dump = collected.lock();
                    dump.inbound_connections.extend(inbound);
                    dump.outbound_connections.extend(outbound);
                },
            )));
        }
        latch.wait();

        let mut dump = std::mem::take(&mut *collected.lock());
        dump.inbound_connections
            .sort_by_key(|c| (c.reactor, c.remote));
        dump.outbound_connections
            .sort_by_key(|c| (c.reactor, c.remote));
        Ok(dump)
    }

    fn queue_event_on_all_reactors(&self, payload: &[u8]) -> Result<()> {
        self.check_not_closing()?;
        let frame = encode_frame(&FrameHeader::Event, payload, self.config.max_frame_size)?;
        for reactor in &self.reactors {
            let frame = frame.clone();
            reactor.schedule_reactor_task(Box::new(FunctorReactorTask(
                move |context: &mut ReactorContext| {
                    let sent = context.broadcast_event(&frame);
                    debug!(reactor = context.idx(), connections = sent, "Server event queued");
                },
            )));
        }
        Ok(())
    }

    /// Run the shutdown sequence once; later callers wait for it to finish
    fn shutdown(&self) {
        let acceptor = {
            let mut state = self.state.write();
            if state.closing {
                drop(state);
                self.wait_for_shutdown();
                return;
            }
            state.closing = true;
            state.acceptor.take()
        };

        info!(messenger = %self.name, "Shutting down messenger");
        self.services.close();

        if let Some(acceptor) = acceptor {
            acceptor.shutdown();
        }
        for reactor in &self.reactors {
            reactor.shutdown();
        }
        self.scheduler.shutdown();
        for reactor in &self.reactors {
            reactor.join();
        }
        self.io_pool.join();

        let leftovers: Vec<_> = self
            .scheduled_tasks
            .lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in leftovers {
            slot.abort(RpcError::aborted(format!(
                "Messenger {} is shutting down",
                self.name
            )));
        }

        self.shutdown_done.count_down();
        info!(messenger = %self.name, "Messenger shut down");
    }

    fn wait_for_shutdown(&self) {
        // Internal threads must not block on a sequence that may be joining them
        let internal =
            tokio::runtime::Handle::try_current().is_ok() || self.is_on_reactor_thread();
        if internal {
            return;
        }
        self.shutdown_done.wait();
        // A sequence run on a reactor thread could not join that thread itself
        for reactor in &self.reactors {
            reactor.join();
        }
    }

    fn all_external_references_dropped(&self) {
        debug!(messenger = %self.name, "All external references dropped");
        self.shutdown();
    }
}

struct ExternalHandle {
    inner: Arc<MessengerInner>,
}

impl Drop for ExternalHandle {
    fn drop(&mut self) {
        self.inner.all_external_references_dropped();
    }
}

/// Handle to a running RPC runtime.
///
/// Clones share one runtime. Dropping the last clone shuts it down.
#[derive(Clone)]
pub struct Messenger {
    handle: Arc<ExternalHandle>,
}

impl Messenger {
    pub fn builder(name: impl Into<String>) -> MessengerBuilder {
        MessengerBuilder::new(name)
    }

    fn inner(&self) -> &Arc<MessengerInner> {
        &self.handle.inner
    }

    pub fn name(&self) -> &str {
        &self.inner().name
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner().config
    }

    /// Bind a listen address, creating the acceptor on first use
    pub fn listen_address(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.inner().listen_address(addr)
    }

    /// Addresses bound by the current acceptor
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.inner()
            .state
            .read()
            .acceptor
            .as_ref()
            .map(|acceptor| acceptor.bound_addresses())
            .unwrap_or_default()
    }

    pub fn start_acceptor(&self) -> Result<()> {
        self.inner().start_acceptor()
    }

    /// Stop accepting without shutting the messenger down
    pub fn shutdown_acceptor(&self) {
        self.inner().shutdown_acceptor();
    }

    /// Whether an acceptor thread is currently accepting connections
    pub fn is_accepting(&self) -> bool {
        self.inner()
            .state
            .read()
            .acceptor
            .as_ref()
            .is_some_and(|acceptor| acceptor.is_started())
    }

    pub fn register_service(&self, name: &str, service: Arc<dyn RpcService>) -> Result<()> {
        self.inner().register_service(name, service)
    }

    pub fn unregister_service(&self, name: &str) -> Result<()> {
        self.inner().services.unregister(name)
    }

    pub fn unregister_all_services(&self) {
        self.inner().services.unregister_all();
    }

    /// Hand a call to the reactor owning its connection
    pub fn queue_outbound_call(&self, call: Arc<OutboundCall>) {
        self.inner().queue_outbound_call(call);
    }

    /// Build and queue a call, spreading calls over the parallel connections
    pub fn call<F>(
        &self,
        remote: SocketAddr,
        method: RemoteMethod,
        payload: Bytes,
        timeout: Duration,
        callback: F,
    ) -> Arc<OutboundCall>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let inner = self.inner();
        let idx = inner.next_connection_idx.fetch_add(1, Ordering::Relaxed)
            % inner.config.num_connections_to_server;
        let call = OutboundCall::new(
            ConnectionId::new(remote, idx),
            method,
            payload,
            timeout,
            callback,
        );
        inner.queue_outbound_call(Arc::clone(&call));
        call
    }

    pub fn queue_inbound_call(&self, call: InboundCall) {
        self.inner().queue_inbound_call(call);
    }

    pub fn handle(&self, call: InboundCall) {
        self.inner().queue_inbound_call(call);
    }

    /// Route an already accepted socket to a reactor
    pub fn register_inbound_socket(&self, stream: std::net::TcpStream, remote: SocketAddr) {
        self.inner().register_inbound_socket(stream, remote);
    }

    /// Run `callback` on a reactor after `delay`; cancellable via [`Messenger::abort_on_reactor`]
    pub fn schedule_on_reactor<F>(&self, delay: Duration, callback: F) -> ScheduledTaskId
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.inner()
            .schedule_on_reactor(delay, Box::new(callback), true)
            .unwrap_or_default()
    }

    /// Fire-and-forget variant of [`Messenger::schedule_on_reactor`]
    pub fn schedule_on_reactor_detached<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.inner()
            .schedule_on_reactor(delay, Box::new(callback), false);
    }

    /// Abort a pending task; returns false if it already ran or is unknown
    pub fn abort_on_reactor(&self, id: ScheduledTaskId) -> bool {
        self.inner().abort_on_reactor(id)
    }

    /// Fault injection: fail all traffic with `ip` and drop its connections
    pub fn break_connectivity_with(&self, ip: IpAddr) {
        self.inner().break_connectivity_with(ip);
    }

    pub fn restore_connectivity_with(&self, ip: IpAddr) {
        self.inner().restore_connectivity_with(ip);
    }

    pub fn is_artificially_disconnected_from(&self, ip: IpAddr) -> bool {
        self.inner().is_artificially_disconnected_from(ip)
    }

    /// In-flight calls on every connection of every reactor
    pub fn dump_running_rpcs(&self) -> Result<RunningRpcsDump> {
        self.inner().dump_running_rpcs()
    }

    /// Push an event frame to every connected client
    pub fn queue_event_on_all_reactors(&self, payload: &[u8]) -> Result<()> {
        self.inner().queue_event_on_all_reactors(payload)
    }

    /// Idempotent; safe from any thread, including reactor threads
    pub fn shutdown(&self) {
        self.inner().shutdown();
    }

    pub fn is_closing(&self) -> bool {
        self.inner().is_closing()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner().scheduler
    }

    pub fn metrics(&self) -> &Arc<MessengerMetrics> {
        &self.inner().metrics
    }

    pub fn num_reactors(&self) -> usize {
        self.inner().reactors.len()
    }

    /// Reactor threads that have not exited yet
    pub fn running_reactor_threads(&self) -> usize {
        self.inner()
            .reactors
            .iter()
            .filter(|reactor| reactor.is_running())
            .count()
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.inner().config.num_connections_to_server
    }
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Messenger")
            .field("name", &inner.name)
            .field("reactors", &inner.reactors.iter().map(Reactor::name).collect::<Vec<_>>())
            .field("services", &inner.services)
            .field("closing", &inner.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_routing_is_stable(
            octets in any::<[u8; 4]>(),
            port in any::<u16>(),
            idx in 0usize..64,
            num_reactors in 1usize..32,
        ) {
            let remote = SocketAddr::from((octets, port));
            let first = route_to_reactor(&remote, idx, num_reactors);
            prop_assert!(first < num_reactors);
            for _ in 0..4 {
                prop_assert_eq!(route_to_reactor(&remote, idx, num_reactors), first);
            }
        }
    }

    #[test]
    fn test_connection_index_spreads_over_reactors() {
        let remote: SocketAddr = "10.0.0.7:9100".parse().unwrap();
        let base = route_to_reactor(&remote, 0, 4);
        let reactors: Vec<_> = (0..4).map(|idx| route_to_reactor(&remote, idx, 4)).collect();
        let expected: Vec<_> = (0..4).map(|idx| (base + idx) % 4).collect();
        assert_eq!(reactors, expected);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = MessengerBuilder::new("bad").num_reactors(0).build().unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument { .. }));
    }

    #[test]
    fn test_builder_setters() {
        let builder = MessengerBuilder::new("ts-1")
            .num_reactors(2)
            .connection_keepalive(Duration::ZERO)
            .coarse_timer_granularity(Duration::from_millis(20))
            .num_connections_to_server(3);
        let config = builder.config();
        assert_eq!(config.name, "ts-1");
        assert_eq!(config.num_reactors, 2);
        assert_eq!(config.connection_keepalive_ms, 0);
        assert_eq!(config.coarse_timer_granularity_ms, 20);
        assert_eq!(config.num_connections_to_server, 3);
    }

    #[test]
    fn test_reactor_start_failure_unwinds_started_reactors() {
        let inner = MessengerBuilder::new("unit-unwind")
            .num_reactors(3)
            .io_thread_pool_size(1)
            .into_inner()
            .unwrap();
        // Occupy reactor 1 so the second start attempt fails
        inner.reactors[1].init(Arc::clone(&inner)).unwrap();

        let err = inner.start_reactors().unwrap_err();
        match err {
            RpcError::IllegalState { message } => {
                assert_eq!(message, "Reactor unit-unwind_R001 already initialized");
            }
            other => panic!("Expected IllegalState, got {:?}", other),
        }

        assert!(inner.is_closing());
        assert!(inner.services.is_closed());
        for reactor in &inner.reactors {
            assert!(reactor.is_closing(), "{} still open", reactor.name());
            assert!(!reactor.is_running(), "{} still running", reactor.name());
        }
    }

    #[test]
    fn test_build_and_drop_joins_reactors() {
        let messenger = MessengerBuilder::new("unit-lifecycle")
            .num_reactors(2)
            .io_thread_pool_size(1)
            .build()
            .unwrap();
        assert_eq!(messenger.num_reactors(), 2);
        assert_eq!(messenger.running_reactor_threads(), 2);
        assert_eq!(messenger.max_concurrent_requests(), 8);

        let clone = messenger.clone();
        drop(messenger);
        assert!(!clone.is_closing());

        clone.shutdown();
        assert!(clone.is_closing());
        assert_eq!(clone.running_reactor_threads(), 0);
    }
}
