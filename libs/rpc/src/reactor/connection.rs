//! Reactor-Owned Connections
//!
//! Each connection is a task on its reactor's `LocalSet`. It owns the socket,
//! the partially received input buffer and the outbound calls awaiting a
//! response, keyed by call id. Other threads reach it only through
//! [`ConnectionCommand`]s sent via its reactor or via an inbound call's
//! responder.
//!
//! The reactor shares a small [`ConnectionState`] with the task for idle
//! scanning and diagnostics; neither side holds that borrow across an await.
//!
//! Encoded frames go to a separate writer task that owns the socket's write
//! half. The connection task never awaits a write, so a peer that stops
//! reading cannot hold up call deadlines, commands or input.

use super::ReactorEvent;
use crate::call::{
    ConnectionId, InboundCall, OutboundCall, RemoteMethod, RpcCallInProgress, RpcConnectionDump,
};
use crate::frame::{
    consume_preamble, decode_frame, encode_frame, Frame, FrameHeader, WireError,
    CONNECTION_PREAMBLE,
};
use crate::messenger::MessengerInner;
use crate::metrics::MessengerMetrics;
use crate::{Result, RpcError};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Work handed to a connection task
pub(crate) enum ConnectionCommand {
    /// Send an outbound call and track it until its response
    Call(Arc<OutboundCall>),
    /// Write an encoded response to an inbound call
    Respond { call_id: u32, frame: Bytes },
    /// Write an encoded server event
    Event(Bytes),
    /// Close the connection, failing everything pending with the given error
    Shutdown(RpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Open => write!(f, "open"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

struct PendingCall {
    call: Arc<OutboundCall>,
    timer: Option<AbortHandle>,
}

struct InboundSummary {
    method: RemoteMethod,
    received_at: Instant,
}

/// State visible to the owning reactor
pub(crate) struct ConnectionState {
    remote: SocketAddr,
    direction: Direction,
    status: ConnectionStatus,
    last_activity: Instant,
    outbound: BTreeMap<u32, PendingCall>,
    inbound: BTreeMap<u32, InboundSummary>,
}

impl ConnectionState {
    fn new(remote: SocketAddr, direction: Direction) -> Self {
        Self {
            remote,
            direction,
            status: ConnectionStatus::Connecting,
            last_activity: Instant::now(),
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
        }
    }

    /// No call in either direction and quiet for longer than `keepalive`
    pub(crate) fn is_idle(&self, keepalive: Duration, now: Instant) -> bool {
        self.status == ConnectionStatus::Open
            && self.outbound.is_empty()
            && self.inbound.is_empty()
            && now.saturating_duration_since(self.last_activity) > keepalive
    }

    pub(crate) fn dump(&self, reactor: usize) -> RpcConnectionDump {
        let now = Instant::now();
        let calls_in_flight = match self.direction {
            Direction::Server => self
                .inbound
                .iter()
                .map(|(call_id, summary)| RpcCallInProgress {
                    call_id: *call_id,
                    service: summary.method.service().to_string(),
                    method: summary.method.method().to_string(),
                    elapsed_ms: now
                        .saturating_duration_since(summary.received_at)
                        .as_millis() as u64,
                })
                .collect(),
            Direction::Client => self
                .outbound
                .iter()
                .map(|(call_id, pending)| RpcCallInProgress {
                    call_id: *call_id,
                    service: pending.call.remote_method().service().to_string(),
                    method: pending.call.remote_method().method().to_string(),
                    elapsed_ms: pending.call.elapsed().as_millis() as u64,
                })
                .collect(),
        };

        RpcConnectionDump {
            remote: self.remote,
            reactor,
            state: self.status.to_string(),
            calls_in_flight,
        }
    }
}

/// Reactor-side handle of a connection task
pub(crate) struct ConnectionHandle {
    pub(crate) remote: SocketAddr,
    pub(crate) direction: Direction,
    pub(crate) conn_id: Option<ConnectionId>,
    pub(crate) commands: mpsc::UnboundedSender<ConnectionCommand>,
    pub(crate) state: Rc<RefCell<ConnectionState>>,
    pub(crate) task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Ask the task to close; returns false if it already exited
    pub(crate) fn shutdown(&self, reason: RpcError) -> bool {
        self.commands.send(ConnectionCommand::Shutdown(reason)).is_ok()
    }
}

/// Start connecting to `conn_id` on the current reactor
pub(crate) fn spawn_client(
    conn_id: ConnectionId,
    serial: u64,
    reactor: usize,
    messenger: Arc<MessengerInner>,
    events: mpsc::UnboundedSender<ReactorEvent>,
) -> ConnectionHandle {
    let (connection, (commands, state)) = Connection::new(
        conn_id.remote(),
        Direction::Client,
        serial,
        reactor,
        messenger,
        events,
    );
    let task = tokio::task::spawn_local(connection.run(None));

    ConnectionHandle {
        remote: conn_id.remote(),
        direction: Direction::Client,
        conn_id: Some(conn_id),
        commands,
        state,
        task,
    }
}

/// Wrap an accepted socket on the current reactor
pub(crate) fn spawn_server(
    stream: TcpStream,
    remote: SocketAddr,
    serial: u64,
    reactor: usize,
    messenger: Arc<MessengerInner>,
    events: mpsc::UnboundedSender<ReactorEvent>,
) -> ConnectionHandle {
    let (connection, (commands, state)) = Connection::new(
        remote,
        Direction::Server,
        serial,
        reactor,
        messenger,
        events,
    );
    let task = tokio::task::spawn_local(connection.run(Some(stream)));

    ConnectionHandle {
        remote,
        direction: Direction::Server,
        conn_id: None,
        commands,
        state,
        task,
    }
}

type HandleParts = (
    mpsc::UnboundedSender<ConnectionCommand>,
    Rc<RefCell<ConnectionState>>,
);

/// Sending side of the writer task
struct WriteQueue {
    frames: mpsc::UnboundedSender<Bytes>,
    task: AbortHandle,
}

struct Connection {
    remote: SocketAddr,
    direction: Direction,
    serial: u64,
    reactor: usize,
    messenger: Arc<MessengerInner>,
    state: Rc<RefCell<ConnectionState>>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    responder: mpsc::UnboundedSender<ConnectionCommand>,
    timeouts_tx: mpsc::UnboundedSender<u32>,
    timeouts_rx: mpsc::UnboundedReceiver<u32>,
    events: mpsc::UnboundedSender<ReactorEvent>,
    read_buf: BytesMut,
    writer: Option<WriteQueue>,
    unsent: VecDeque<u32>,
    next_call_id: u32,
    preamble_pending: bool,
    closed: bool,
}

impl Connection {
    fn new(
        remote: SocketAddr,
        direction: Direction,
        serial: u64,
        reactor: usize,
        messenger: Arc<MessengerInner>,
        events: mpsc::UnboundedSender<ReactorEvent>,
    ) -> (Self, HandleParts) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        let state = Rc::new(RefCell::new(ConnectionState::new(remote, direction)));
        let read_buf = BytesMut::with_capacity(messenger.config().read_buffer_size);

        let connection = Self {
            remote,
            direction,
            serial,
            reactor,
            messenger,
            state: Rc::clone(&state),
            commands: commands_rx,
            responder: commands_tx.clone(),
            timeouts_tx,
            timeouts_rx,
            events,
            read_buf,
            writer: None,
            unsent: VecDeque::new(),
            next_call_id: 0,
            preamble_pending: direction == Direction::Server,
            closed: false,
        };
        (connection, (commands_tx, state))
    }

    async fn run(mut self, stream: Option<TcpStream>) {
        let stream = match stream {
            Some(stream) => stream,
            None => match self.connect().await {
                Ok(stream) => stream,
                Err(error) => {
                    self.close(error);
                    return;
                }
            },
        };

        let reason = self.serve(stream).await;
        self.close(reason);
    }

    /// Connect while still accepting calls and expiring their deadlines
    async fn connect(&mut self) -> Result<TcpStream> {
        let config = self.messenger.config();
        let bind = self.messenger.outbound_bind_address(&self.remote);
        let connect = open_socket(self.remote, bind, config.connect_timeout());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    let stream = result?;
                    self.messenger.metrics().record_connection_established();
                    info!(
                        messenger = %self.messenger.name(),
                        reactor = self.reactor,
                        remote = %self.remote,
                        "Outbound connection established"
                    );
                    return Ok(stream);
                }
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Call(call)) => {
                        self.enqueue_call(call);
                    }
                    Some(ConnectionCommand::Shutdown(reason)) => return Err(reason),
                    Some(_) => {}
                    None => return Err(RpcError::aborted("Connection handle dropped")),
                },
                Some(call_id) = self.timeouts_rx.recv() => self.expire_call(call_id),
            }
        }
    }

    /// Run until the connection has to close; returns the reason
    async fn serve(&mut self, stream: TcpStream) -> RpcError {
        let (mut reader, writer) = stream.into_split();
        let (failed_tx, mut write_failures) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn_local(write_frames(
            writer,
            frames_rx,
            self.remote,
            Arc::clone(self.messenger.metrics()),
            Rc::clone(&self.state),
            failed_tx,
        ));
        self.writer = Some(WriteQueue {
            frames: frames_tx,
            task: task.abort_handle(),
        });

        self.state.borrow_mut().status = ConnectionStatus::Open;
        self.touch();

        if self.direction == Direction::Client {
            if let Err(error) = self.write(Bytes::from_static(CONNECTION_PREAMBLE)) {
                return error;
            }
            while let Some(call_id) = self.unsent.pop_front() {
                if let Err(error) = self.send_call(call_id) {
                    return error;
                }
            }
        }

        loop {
            tokio::select! {
                read = reader.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => {
                        return RpcError::network("Connection closed by peer", Some(self.remote));
                    }
                    Ok(n) => {
                        self.messenger.metrics().record_bytes_received(n);
                        self.touch();
                        if let Err(error) = self.process_input() {
                            warn!(
                                messenger = %self.messenger.name(),
                                remote = %self.remote,
                                error = %error,
                                "Malformed input, closing connection"
                            );
                            return error;
                        }
                    }
                    Err(e) => {
                        return RpcError::network_with_source("Read failed", Some(self.remote), e);
                    }
                },
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return RpcError::aborted("Connection handle dropped");
                    };
                    if let Err(error) = self.handle_command(command) {
                        return error;
                    }
                }
                Some(call_id) = self.timeouts_rx.recv() => self.expire_call(call_id),
                Some(error) = write_failures.recv() => return error,
            }
        }
    }

    fn handle_command(&mut self, command: ConnectionCommand) -> Result<()> {
        match command {
            ConnectionCommand::Call(call) => {
                if let Some(call_id) = self.enqueue_call(call) {
                    self.send_call(call_id)?;
                }
                Ok(())
            }
            ConnectionCommand::Respond { call_id, frame } => {
                self.state.borrow_mut().inbound.remove(&call_id);
                if frame.is_empty() {
                    return Ok(());
                }
                self.write(frame)
            }
            ConnectionCommand::Event(frame) => self.write(frame),
            ConnectionCommand::Shutdown(reason) => Err(reason),
        }
    }

    /// Assign a call id and arm the deadline; returns the id if the call is live
    fn enqueue_call(&mut self, call: Arc<OutboundCall>) -> Option<u32> {
        if call.is_finished() {
            return None;
        }

        self.next_call_id = self.next_call_id.wrapping_add(1);
        let call_id = self.next_call_id;
        let timer = self.arm_timer(call_id, call.timeout());
        self.state
            .borrow_mut()
            .outbound
            .insert(call_id, PendingCall { call, timer });

        if self.state.borrow().status == ConnectionStatus::Open {
            Some(call_id)
        } else {
            self.unsent.push_back(call_id);
            None
        }
    }

    fn arm_timer(&self, call_id: u32, timeout: Duration) -> Option<AbortHandle> {
        if timeout.is_zero() {
            return None;
        }
        let timeouts = self.timeouts_tx.clone();
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeouts.send(call_id);
        });
        Some(timer.abort_handle())
    }

    fn expire_call(&mut self, call_id: u32) {
        let pending = self.state.borrow_mut().outbound.remove(&call_id);
        if let Some(pending) = pending {
            debug!(
                remote = %self.remote,
                call_id,
                call = %pending.call.remote_method(),
                "Outbound call timed out"
            );
            pending.call.set_timed_out();
        }
    }

    fn send_call(&mut self, call_id: u32) -> Result<()> {
        let call = match self.state.borrow().outbound.get(&call_id) {
            Some(pending) => Arc::clone(&pending.call),
            None => return Ok(()),
        };

        let header = FrameHeader::Request {
            call_id,
            service: call.remote_method().service().to_string(),
            method: call.remote_method().method().to_string(),
            timeout_ms: call.timeout().as_millis() as u64,
        };
        let max_frame_size = self.messenger.config().max_frame_size;
        let frame = match encode_frame(&header, call.payload(), max_frame_size) {
            Ok(frame) => frame,
            Err(error) => {
                // Only this call is affected
                self.complete_call(call_id, Err(error));
                return Ok(());
            }
        };

        call.set_sent(call_id);
        self.write(frame)?;
        trace!(
            remote = %self.remote,
            call_id,
            call = %call.remote_method(),
            "Call queued for write"
        );
        Ok(())
    }

    /// Hand a frame to the writer task; frames go out in the order queued
    fn write(&self, frame: Bytes) -> Result<()> {
        let writer = self.writer.as_ref().ok_or_else(|| {
            RpcError::illegal_state(format!("Connection to {} is not open", self.remote))
        })?;
        writer
            .frames
            .send(frame)
            .map_err(|_| RpcError::network("Writer exited", Some(self.remote)))
    }

    /// Decode and dispatch every complete frame in the input buffer, in order
    fn process_input(&mut self) -> Result<()> {
        if self.preamble_pending {
            if !consume_preamble(&mut self.read_buf)? {
                return Ok(());
            }
            self.preamble_pending = false;
        }

        let max_frame_size = self.messenger.config().max_frame_size;
        while let Some(Frame { header, payload }) =
            decode_frame(&mut self.read_buf, max_frame_size)?
        {
            match (self.direction, header) {
                (
                    Direction::Server,
                    FrameHeader::Request {
                        call_id,
                        service,
                        method,
                        timeout_ms,
                    },
                ) => {
                    let method = RemoteMethod::new(service, method);
                    self.dispatch_inbound(call_id, method, timeout_ms, payload);
                }
                (Direction::Client, FrameHeader::Response { call_id, error }) => {
                    let result = match error {
                        None => Ok(payload),
                        Some(WireError { code, message }) => Err(RpcError::remote(code, message)),
                    };
                    self.complete_call(call_id, result);
                }
                (Direction::Client, FrameHeader::Event) => {
                    if let Some(listener) = self.messenger.server_event_listener() {
                        listener(self.remote, payload);
                    } else {
                        trace!(remote = %self.remote, "Server event dropped, no listener");
                    }
                }
                (direction, header) => {
                    return Err(RpcError::protocol(format!(
                        "Unexpected {:?} frame on {:?} connection",
                        header, direction
                    )));
                }
            }
        }
        Ok(())
    }

    fn dispatch_inbound(
        &mut self,
        call_id: u32,
        method: RemoteMethod,
        timeout_ms: u64,
        payload: Bytes,
    ) {
        self.state.borrow_mut().inbound.insert(
            call_id,
            InboundSummary {
                method: method.clone(),
                received_at: Instant::now(),
            },
        );

        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        let call = InboundCall::new(
            self.remote,
            method,
            call_id,
            payload,
            timeout,
            self.messenger.config().max_frame_size,
            self.responder.clone(),
        );
        self.messenger.metrics().record_inbound_call();
        self.messenger.queue_inbound_call(call);
    }

    fn complete_call(&mut self, call_id: u32, result: Result<Bytes>) {
        let pending = self.state.borrow_mut().outbound.remove(&call_id);
        match pending {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                pending.call.set_response(result);
            }
            None => {
                trace!(remote = %self.remote, call_id, "Response for unknown or expired call");
            }
        }
    }

    fn touch(&self) {
        self.state.borrow_mut().last_activity = Instant::now();
    }

    /// Fail outstanding outbound calls and forget inbound summaries
    fn fail_pending(&mut self, reason: &RpcError) {
        let pending = {
            let mut state = self.state.borrow_mut();
            state.inbound.clear();
            std::mem::take(&mut state.outbound)
        };
        self.unsent.clear();

        for (_, pending) in pending {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            pending.call.transferred(reason.clone());
        }
    }

    fn drain_commands(&mut self, reason: &RpcError) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let ConnectionCommand::Call(call) = command {
                call.transferred(reason.clone());
            }
        }
    }

    fn close(&mut self, reason: RpcError) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(writer) = self.writer.take() {
            writer.task.abort();
        }

        let was_open = {
            let mut state = self.state.borrow_mut();
            let was_open = state.status == ConnectionStatus::Open;
            state.status = ConnectionStatus::Closed;
            was_open
        };

        debug!(
            messenger = %self.messenger.name(),
            reactor = self.reactor,
            remote = %self.remote,
            direction = ?self.direction,
            reason = %reason,
            "Connection closed"
        );

        self.fail_pending(&reason);
        self.drain_commands(&reason);
        if was_open {
            self.messenger.metrics().record_connection_closed();
        }
        let _ = self.events.send(ReactorEvent::ConnectionClosed {
            serial: self.serial,
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            self.close(RpcError::aborted("Connection task dropped"));
        }
    }
}

/// Writer task body; owns the write half until the connection closes
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    remote: SocketAddr,
    metrics: Arc<MessengerMetrics>,
    state: Rc<RefCell<ConnectionState>>,
    failed: mpsc::UnboundedSender<RpcError>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            let _ = failed.send(RpcError::network_with_source("Write failed", Some(remote), e));
            return;
        }
        metrics.record_bytes_sent(frame.len());
        state.borrow_mut().last_activity = Instant::now();
    }
}

async fn open_socket(
    remote: SocketAddr,
    bind: Option<IpAddr>,
    timeout: Duration,
) -> Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = bind {
        socket.bind(SocketAddr::new(ip, 0)).map_err(|e| {
            RpcError::network_with_source("Failed to bind outbound socket", Some(remote), e)
        })?;
    }

    let stream = match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(RpcError::network_with_source("Connect failed", Some(remote), e));
        }
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            return Err(RpcError::timed_out(format!("Connect to {}", remote), timeout_ms));
        }
    };
    stream.set_nodelay(true).map_err(|e| {
        RpcError::network_with_source("Failed to set TCP_NODELAY", Some(remote), e)
    })?;
    Ok(stream)
}
