//! Reactors
//!
//! A reactor is one dedicated thread running a current-thread tokio runtime
//! and a `LocalSet`. It owns a disjoint set of connections; every read, write
//! and call-state mutation for them happens on that thread. Other threads hand
//! it work through an unbounded channel of [`ReactorTask`]s.
//!
//! Every task queued to a reactor either runs on the reactor thread or is
//! aborted exactly once, including tasks that race with shutdown.

pub(crate) mod connection;

use crate::call::{ConnectionId, OutboundCall, RpcConnectionDump};
use crate::messenger::MessengerInner;
use crate::scheduler::{ScheduledTaskId, TaskCallback};
use crate::{Result, RpcError};
use bytes::Bytes;
use connection::{ConnectionCommand, ConnectionHandle, Direction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, LocalSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Unit of work executed on a reactor thread
pub(crate) trait ReactorTask: Send + 'static {
    fn run(self: Box<Self>, reactor: &mut ReactorContext);

    /// Called instead of `run` when the reactor cannot execute the task
    fn abort(self: Box<Self>, error: RpcError);
}

/// Closure task; aborting simply drops the closure
pub(crate) struct FunctorReactorTask<F>(pub(crate) F);

impl<F> ReactorTask for FunctorReactorTask<F>
where
    F: FnOnce(&mut ReactorContext) + Send + 'static,
{
    fn run(self: Box<Self>, reactor: &mut ReactorContext) {
        (self.0)(reactor);
    }

    fn abort(self: Box<Self>, error: RpcError) {
        trace!(error = %error, "Functor task aborted");
    }
}

/// Route an outbound call to its connection on this reactor
pub(crate) struct OutboundCallTask(pub(crate) Arc<OutboundCall>);

impl ReactorTask for OutboundCallTask {
    fn run(self: Box<Self>, reactor: &mut ReactorContext) {
        reactor.assign_outbound_call(self.0);
    }

    fn abort(self: Box<Self>, error: RpcError) {
        self.0.transferred(error);
    }
}

/// Adopt an accepted socket as a server connection
pub(crate) struct RegisterInboundSocketTask {
    pub(crate) stream: std::net::TcpStream,
    pub(crate) remote: SocketAddr,
}

impl ReactorTask for RegisterInboundSocketTask {
    fn run(self: Box<Self>, reactor: &mut ReactorContext) {
        reactor.register_inbound_socket(self.stream, self.remote);
    }

    fn abort(self: Box<Self>, error: RpcError) {
        debug!(remote = %self.remote, error = %error, "Inbound socket dropped");
    }
}

/// Holds a delayed callback until it fires or is aborted, whichever comes first
pub(crate) struct DelayedTaskSlot {
    callback: Mutex<Option<TaskCallback>>,
}

impl DelayedTaskSlot {
    pub(crate) fn new(callback: TaskCallback) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(callback)),
        })
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn fire(&self) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(Ok(()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn abort(&self, error: RpcError) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(Err(error));
                true
            }
            None => false,
        }
    }
}

/// Delayed callback armed on a reactor's timer
pub(crate) struct DelayedTask {
    slot: Arc<DelayedTaskSlot>,
    delay: Duration,
    /// Set for tasks registered with the messenger for cancellation by id
    owner: Option<(Arc<MessengerInner>, ScheduledTaskId)>,
}

impl DelayedTask {
    pub(crate) fn new(
        slot: Arc<DelayedTaskSlot>,
        delay: Duration,
        owner: Option<(Arc<MessengerInner>, ScheduledTaskId)>,
    ) -> Self {
        Self { slot, delay, owner }
    }

    fn fire(self) {
        self.slot.fire();
        self.release();
    }

    fn cancel(self, error: RpcError) {
        self.slot.abort(error);
        self.release();
    }

    fn release(self) {
        if let Some((messenger, id)) = self.owner {
            messenger.remove_scheduled_task(id);
        }
    }
}

impl ReactorTask for DelayedTask {
    fn run(self: Box<Self>, reactor: &mut ReactorContext) {
        reactor.arm_delayed_task(*self);
    }

    fn abort(self: Box<Self>, error: RpcError) {
        self.cancel(error);
    }
}

pub(crate) enum ReactorMessage {
    Task(Box<dyn ReactorTask>),
    Shutdown,
}

/// Notifications from tasks running on the reactor's own `LocalSet`
pub(crate) enum ReactorEvent {
    ConnectionClosed { serial: u64 },
    DelayedTaskDue(u64),
}

/// Thread-safe handle of one reactor
pub(crate) struct Reactor {
    idx: usize,
    name: String,
    sender: mpsc::UnboundedSender<ReactorMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ReactorMessage>>>,
    closing: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
}

impl Reactor {
    pub(crate) fn new(messenger_name: &str, idx: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            idx,
            name: format!("{}_R{:03}", messenger_name, idx),
            sender,
            receiver: Mutex::new(Some(receiver)),
            closing: AtomicBool::new(false),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
        }
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Start the reactor thread and wait until its event loop exists
    pub(crate) fn init(&self, messenger: Arc<MessengerInner>) -> Result<()> {
        let receiver = self.receiver.lock().take().ok_or_else(|| {
            RpcError::illegal_state(format!("Reactor {} already initialized", self.name))
        })?;

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let idx = self.idx;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let local = LocalSet::new();
                let context = ReactorContext::new(idx, name, messenger);
                local.block_on(&runtime, context.run(receiver));

                let _enter = runtime.enter();
                drop(local);
            })?;

        let _ = self.thread_id.set(handle.thread().id());
        *self.thread.lock() = Some(handle);

        match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::illegal_state(format!(
                "Reactor {} exited during startup",
                self.name
            ))),
        }
    }

    /// Queue a task; aborts it inline if the reactor no longer accepts work
    pub(crate) fn schedule_reactor_task(&self, task: Box<dyn ReactorTask>) {
        if self.is_closing() {
            task.abort(self.shutting_down());
            return;
        }
        if let Err(mpsc::error::SendError(ReactorMessage::Task(task))) =
            self.sender.send(ReactorMessage::Task(task))
        {
            task.abort(self.shutting_down());
        }
    }

    /// Ask the loop to close its connections and exit
    pub(crate) fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        // Never initialized: fail whatever was queued here
        if let Some(mut receiver) = self.receiver.lock().take() {
            receiver.close();
            while let Ok(message) = receiver.try_recv() {
                if let ReactorMessage::Task(task) = message {
                    task.abort(self.shutting_down());
                }
            }
            return;
        }

        let _ = self.sender.send(ReactorMessage::Shutdown);
    }

    /// Wait for the thread to exit; skipped when called from the thread itself
    pub(crate) fn join(&self) {
        if self.is_current_thread() {
            debug!(reactor = %self.name, "Skipping self-join");
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(reactor = %self.name, "Reactor thread panicked");
            }
        }
    }

    pub(crate) fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn shutting_down(&self) -> RpcError {
        RpcError::service_unavailable(format!("Reactor {} is shutting down", self.name))
    }
}

struct ArmedTask {
    task: DelayedTask,
    timer: AbortHandle,
}

/// Reactor-thread state; only ever touched by tasks running on that thread
pub(crate) struct ReactorContext {
    idx: usize,
    name: String,
    messenger: Arc<MessengerInner>,
    connections: HashMap<u64, ConnectionHandle>,
    client_index: HashMap<ConnectionId, u64>,
    next_serial: u64,
    delayed: HashMap<u64, ArmedTask>,
    next_delayed: u64,
    events_tx: mpsc::UnboundedSender<ReactorEvent>,
    events_rx: mpsc::UnboundedReceiver<ReactorEvent>,
}

impl ReactorContext {
    fn new(idx: usize, name: String, messenger: Arc<MessengerInner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            idx,
            name,
            messenger,
            connections: HashMap::new(),
            client_index: HashMap::new(),
            next_serial: 0,
            delayed: HashMap::new(),
            next_delayed: 0,
            events_tx,
            events_rx,
        }
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ReactorMessage>) {
        info!(messenger = %self.messenger.name(), reactor = self.idx, "Reactor started");

        let mut tick = tokio::time::interval(self.messenger.config().coarse_timer_granularity());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(ReactorMessage::Task(task)) => task.run(&mut self),
                    Some(ReactorMessage::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tick.tick() => self.scan_idle_connections(Instant::now()),
            }
        }

        self.shutdown(receiver).await;
        info!(messenger = %self.messenger.name(), reactor = self.idx, "Reactor stopped");
    }

    async fn shutdown(&mut self, mut receiver: mpsc::UnboundedReceiver<ReactorMessage>) {
        let reason =
            RpcError::service_unavailable(format!("Reactor {} is shutting down", self.name));

        receiver.close();
        while let Ok(message) = receiver.try_recv() {
            if let ReactorMessage::Task(task) = message {
                task.abort(reason.clone());
            }
        }

        for connection in self.connections.values() {
            connection.shutdown(reason.clone());
        }
        self.client_index.clear();
        let connections: Vec<_> = self.connections.drain().map(|(_, c)| c).collect();
        debug!(
            reactor = self.idx,
            connections = connections.len(),
            "Closing reactor connections"
        );
        for mut connection in connections {
            if tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, &mut connection.task)
                .await
                .is_err()
            {
                warn!(
                    reactor = self.idx,
                    remote = %connection.remote,
                    "Connection did not close in time, aborting"
                );
                connection.task.abort();
            }
        }

        for (_, armed) in self.delayed.drain() {
            armed.timer.abort();
            armed
                .task
                .cancel(RpcError::aborted(format!("Reactor {} is shutting down", self.name)));
        }
    }

    fn handle_event(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::ConnectionClosed { serial } => {
                if let Some(connection) = self.connections.remove(&serial) {
                    if let Some(conn_id) = connection.conn_id {
                        if self.client_index.get(&conn_id) == Some(&serial) {
                            self.client_index.remove(&conn_id);
                        }
                    }
                }
            }
            ReactorEvent::DelayedTaskDue(local_id) => {
                if let Some(armed) = self.delayed.remove(&local_id) {
                    armed.task.fire();
                }
            }
        }
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    pub(crate) fn assign_outbound_call(&mut self, call: Arc<OutboundCall>) {
        let conn_id = *call.conn_id();
        let mut command = ConnectionCommand::Call(call);

        // A connection may have closed without its event being processed yet
        for _ in 0..2 {
            let serial = self.find_or_start_connection(conn_id);
            let Some(connection) = self.connections.get(&serial) else {
                break;
            };
            match connection.commands.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.client_index.remove(&conn_id);
                    command = returned;
                }
            }
        }

        if let ConnectionCommand::Call(call) = command {
            call.transferred(RpcError::network(
                "Connection closed",
                Some(conn_id.remote()),
            ));
        }
    }

    fn find_or_start_connection(&mut self, conn_id: ConnectionId) -> u64 {
        if let Some(&serial) = self.client_index.get(&conn_id) {
            return serial;
        }

        let serial = self.next_serial();
        debug!(reactor = self.idx, remote = %conn_id, "Opening outbound connection");
        let handle = connection::spawn_client(
            conn_id,
            serial,
            self.idx,
            Arc::clone(&self.messenger),
            self.events_tx.clone(),
        );
        self.connections.insert(serial, handle);
        self.client_index.insert(conn_id, serial);
        serial
    }

    pub(crate) fn register_inbound_socket(
        &mut self,
        stream: std::net::TcpStream,
        remote: SocketAddr,
    ) {
        let stream = match stream
            .set_nonblocking(true)
            .and_then(|_| tokio::net::TcpStream::from_std(stream))
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    reactor = self.idx,
                    remote = %remote,
                    error = %e,
                    "Failed to adopt inbound socket"
                );
                self.messenger.metrics().record_connection_rejected();
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let serial = self.next_serial();
        let handle = connection::spawn_server(
            stream,
            remote,
            serial,
            self.idx,
            Arc::clone(&self.messenger),
            self.events_tx.clone(),
        );
        self.connections.insert(serial, handle);
        debug!(reactor = self.idx, remote = %remote, "Inbound connection registered");
    }

    pub(crate) fn arm_delayed_task(&mut self, task: DelayedTask) {
        if !task.slot.is_pending() {
            task.release();
            return;
        }

        self.next_delayed += 1;
        let local_id = self.next_delayed;
        let events = self.events_tx.clone();
        let delay = task.delay;
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ReactorEvent::DelayedTaskDue(local_id));
        });

        self.delayed.insert(
            local_id,
            ArmedTask {
                task,
                timer: timer.abort_handle(),
            },
        );
    }

    /// Close idle server connections
    fn scan_idle_connections(&mut self, now: Instant) {
        let keepalive = self.messenger.config().connection_keepalive();
        if keepalive.is_zero() {
            return;
        }

        for connection in self.connections.values() {
            if connection.direction != Direction::Server {
                continue;
            }
            if !connection.state.borrow().is_idle(keepalive, now) {
                continue;
            }
            debug!(
                reactor = self.idx,
                remote = %connection.remote,
                keepalive_ms = keepalive.as_millis() as u64,
                "Closing idle connection"
            );
            connection.shutdown(RpcError::network(
                format!("Connection idle for more than {}ms", keepalive.as_millis()),
                Some(connection.remote),
            ));
        }
    }

    /// Close every connection to `ip`; new calls will open fresh connections
    pub(crate) fn drop_with_remote_address(&mut self, ip: IpAddr) {
        let mut dropped = 0;
        for connection in self.connections.values() {
            if connection.remote.ip() == ip {
                connection.shutdown(RpcError::network(
                    "TEST: Connectivity is broken",
                    Some(connection.remote),
                ));
                dropped += 1;
            }
        }
        self.client_index.retain(|conn_id, _| conn_id.remote().ip() != ip);

        if dropped > 0 {
            warn!(reactor = self.idx, remote = %ip, dropped, "TEST: Dropped connections");
        }
    }

    /// Inbound and outbound connection dumps
    pub(crate) fn dump(&self) -> (Vec<RpcConnectionDump>, Vec<RpcConnectionDump>) {
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();
        for connection in self.connections.values() {
            let dump = connection.state.borrow().dump(self.idx);
            match connection.direction {
                Direction::Server => inbound.push(dump),
                Direction::Client => outbound.push(dump),
            }
        }
        (inbound, outbound)
    }

    /// Write an encoded event frame to every server connection
    pub(crate) fn broadcast_event(&self, frame: &Bytes) -> usize {
        let mut sent = 0;
        for connection in self.connections.values() {
            if connection.direction == Direction::Server
                && connection
                    .commands
                    .send(ConnectionCommand::Event(frame.clone()))
                    .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }
}
