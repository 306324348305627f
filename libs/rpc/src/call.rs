//! Calls In Flight
//!
//! [`OutboundCall`] is a client-initiated call shared between the caller, the
//! owning reactor and its timeout timer; whichever of them finishes it first
//! wins and the completion callback fires exactly once.
//!
//! [`InboundCall`] is a server-received call. Responding consumes it, so a
//! second response cannot be expressed.

use crate::error::ErrorCode;
use crate::frame::{encode_frame, FrameHeader, WireError};
use crate::metrics::MessengerMetrics;
use crate::reactor::connection::ConnectionCommand;
use crate::{Result, RpcError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies one of the parallel connections to a remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId {
    remote: SocketAddr,
    idx: usize,
}

impl ConnectionId {
    pub fn new(remote: SocketAddr, idx: usize) -> Self {
        Self { remote, idx }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn idx(&self) -> usize {
        self.idx
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.remote, self.idx)
    }
}

/// Service and method a call is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemoteMethod {
    service: String,
    method: String,
}

impl RemoteMethod {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Completion callback of an outbound call
pub type ResponseCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Lifecycle of an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    Ready,
    OnOutboundQueue,
    Sent,
    FinishedSuccess,
    FinishedError,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::FinishedSuccess | CallState::FinishedError | CallState::TimedOut
        )
    }
}

struct CallInner {
    state: CallState,
    callback: Option<ResponseCallback>,
}

/// Client-side call waiting for its response
pub struct OutboundCall {
    conn_id: ConnectionId,
    method: RemoteMethod,
    payload: Bytes,
    timeout: Duration,
    created_at: Instant,
    call_id: OnceLock<u32>,
    metrics: OnceLock<Arc<MessengerMetrics>>,
    inner: Mutex<CallInner>,
}

impl OutboundCall {
    /// Create a call; a zero `timeout` means no deadline
    pub fn new<F>(
        conn_id: ConnectionId,
        method: RemoteMethod,
        payload: Bytes,
        timeout: Duration,
        callback: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        Arc::new(Self {
            conn_id,
            method,
            payload,
            timeout,
            created_at: Instant::now(),
            call_id: OnceLock::new(),
            metrics: OnceLock::new(),
            inner: Mutex::new(CallInner {
                state: CallState::Ready,
                callback: Some(Box::new(callback)),
            }),
        })
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn remote_method(&self) -> &RemoteMethod {
        &self.method
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Correlation id, assigned once the call is written to a connection
    pub fn call_id(&self) -> Option<u32> {
        self.call_id.get().copied()
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn set_queued(&self, metrics: &Arc<MessengerMetrics>) {
        if self.metrics.set(Arc::clone(metrics)).is_ok() {
            metrics.record_call_queued();
        }
        let mut inner = self.inner.lock();
        if inner.state == CallState::Ready {
            inner.state = CallState::OnOutboundQueue;
        }
    }

    pub(crate) fn set_sent(&self, call_id: u32) {
        let _ = self.call_id.set(call_id);
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = CallState::Sent;
        }
    }

    /// Deliver the peer's answer
    pub(crate) fn set_response(&self, result: Result<Bytes>) -> bool {
        let state = if result.is_ok() {
            CallState::FinishedSuccess
        } else {
            CallState::FinishedError
        };
        self.finish(state, result)
    }

    /// Synthesize a deadline failure through the normal completion path
    pub(crate) fn set_timed_out(&self) -> bool {
        let error = RpcError::timed_out(
            format!("{} RPC to {}", self.method, self.conn_id.remote),
            self.timeout.as_millis() as u64,
        );
        self.finish(CallState::TimedOut, Err(error))
    }

    /// Fail a call that never reached, or was dropped by, its connection
    pub(crate) fn transferred(&self, error: RpcError) -> bool {
        self.finish(CallState::FinishedError, Err(error))
    }

    fn finish(&self, state: CallState, result: Result<Bytes>) -> bool {
        let callback = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = state;
            inner.callback.take()
        };

        if let Some(metrics) = self.metrics.get() {
            metrics.record_call_finished(
                state == CallState::FinishedSuccess,
                state == CallState::TimedOut,
                self.elapsed(),
            );
        }

        debug!(
            call = %self.method,
            remote = %self.conn_id,
            state = ?state,
            elapsed_us = self.elapsed().as_micros() as u64,
            "Outbound call finished"
        );

        if let Some(callback) = callback {
            callback(result);
        }
        true
    }
}

impl fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCall")
            .field("conn_id", &self.conn_id)
            .field("method", &self.method)
            .field("call_id", &self.call_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for OutboundCall {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = CallState::FinishedError;
        if let Some(callback) = inner.callback.take() {
            warn!(
                call = %self.method,
                remote = %self.conn_id,
                "Outbound call dropped before completion"
            );
            callback(Err(RpcError::aborted("Call dropped before completion")));
        }
    }
}

/// Shared handle to an outbound call
pub type OutboundCallPtr = Arc<OutboundCall>;

/// Server-side call waiting for its service to respond
pub struct InboundCall {
    remote: SocketAddr,
    method: RemoteMethod,
    call_id: u32,
    payload: Bytes,
    timeout: Option<Duration>,
    received_at: Instant,
    max_frame_size: usize,
    responder: Option<mpsc::UnboundedSender<ConnectionCommand>>,
}

impl InboundCall {
    pub(crate) fn new(
        remote: SocketAddr,
        method: RemoteMethod,
        call_id: u32,
        payload: Bytes,
        timeout: Option<Duration>,
        max_frame_size: usize,
        responder: mpsc::UnboundedSender<ConnectionCommand>,
    ) -> Self {
        Self {
            remote,
            method,
            call_id,
            payload,
            timeout,
            received_at: Instant::now(),
            max_frame_size,
            responder: Some(responder),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_method(&self) -> &RemoteMethod {
        &self.method
    }

    pub fn service_name(&self) -> &str {
        self.method.service()
    }

    pub fn method_name(&self) -> &str {
        self.method.method()
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Deadline the client attached, if any
    pub fn client_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Send a successful response
    pub fn respond_success(mut self, payload: Bytes) {
        let header = FrameHeader::Response {
            call_id: self.call_id,
            error: None,
        };
        match encode_frame(&header, &payload, self.max_frame_size) {
            Ok(frame) => self.send_response(frame),
            Err(e) => {
                warn!(call = %self.method, error = %e, "Response could not be encoded");
                let frame = self.failure_frame(ErrorCode::ApplicationError, &e.to_string());
                self.send_response(frame);
            }
        }
    }

    /// Send a failed response
    pub fn respond_failure(mut self, code: ErrorCode, error: &RpcError) {
        let frame = self.failure_frame(code, &error.to_string());
        self.send_response(frame);
    }

    fn failure_frame(&self, code: ErrorCode, message: &str) -> Bytes {
        let header = FrameHeader::Response {
            call_id: self.call_id,
            error: Some(WireError {
                code,
                message: message.to_string(),
            }),
        };
        encode_frame(&header, &[], self.max_frame_size).unwrap_or_else(|e| {
            // Only an absurdly long message can get here
            warn!(error = %e, "Failure response could not be encoded");
            Bytes::new()
        })
    }

    fn send_response(&mut self, frame: Bytes) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        let command = ConnectionCommand::Respond {
            call_id: self.call_id,
            frame,
        };
        if responder.send(command).is_err() {
            debug!(
                call = %self.method,
                remote = %self.remote,
                "Connection closed before response could be sent"
            );
        }
    }
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("remote", &self.remote)
            .field("method", &self.method)
            .field("call_id", &self.call_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Drop for InboundCall {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!(
                call = %self.method,
                remote = %self.remote,
                "Inbound call dropped without a response"
            );
            let frame = self.failure_frame(ErrorCode::Unknown, "Call dropped without a response");
            self.send_response(frame);
        }
    }
}

/// One call listed by `dump_running_rpcs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcCallInProgress {
    pub call_id: u32,
    pub service: String,
    pub method: String,
    pub elapsed_ms: u64,
}

/// One connection listed by `dump_running_rpcs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcConnectionDump {
    pub remote: SocketAddr,
    pub reactor: usize,
    pub state: String,
    pub calls_in_flight: Vec<RpcCallInProgress>,
}

/// In-flight calls across all reactors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunningRpcsDump {
    pub inbound_connections: Vec<RpcConnectionDump>,
    pub outbound_connections: Vec<RpcConnectionDump>,
}

impl RunningRpcsDump {
    pub fn total_calls(&self) -> usize {
        self.inbound_connections
            .iter()
            .chain(self.outbound_connections.iter())
            .map(|c| c.calls_in_flight.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_frame;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conn_id() -> ConnectionId {
        ConnectionId::new("127.0.0.1:7100".parse().unwrap(), 0)
    }

    fn counting_call(count: Arc<AtomicUsize>) -> Arc<OutboundCall> {
        OutboundCall::new(
            conn_id(),
            RemoteMethod::new("echo", "Echo"),
            Bytes::from_static(b"ping"),
            Duration::from_millis(50),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_callback_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let call = counting_call(Arc::clone(&fired));

        assert!(call.set_response(Ok(Bytes::from_static(b"pong"))));
        assert!(!call.set_timed_out());
        assert!(!call.transferred(RpcError::network("late", None)));
        drop(call);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_wins_over_late_response() {
        let (tx, rx) = std::sync::mpsc::channel();
        let call = OutboundCall::new(
            conn_id(),
            RemoteMethod::new("echo", "Echo"),
            Bytes::new(),
            Duration::from_millis(50),
            move |result| tx.send(result).unwrap(),
        );
        call.set_sent(9);

        assert!(call.set_timed_out());
        assert!(!call.set_response(Ok(Bytes::from_static(b"late"))));
        assert_eq!(call.state(), CallState::TimedOut);
        assert_eq!(call.call_id(), Some(9));

        match rx.recv().unwrap() {
            Err(RpcError::TimedOut { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_dropped_call_is_aborted() {
        let (tx, rx) = std::sync::mpsc::channel();
        let call = OutboundCall::new(
            conn_id(),
            RemoteMethod::new("echo", "Echo"),
            Bytes::new(),
            Duration::ZERO,
            move |result| tx.send(result).unwrap(),
        );
        drop(call);
        assert!(matches!(rx.recv().unwrap(), Err(RpcError::Aborted { .. })));
    }

    fn inbound(responder: mpsc::UnboundedSender<ConnectionCommand>) -> InboundCall {
        InboundCall::new(
            "127.0.0.1:7200".parse().unwrap(),
            RemoteMethod::new("echo", "Echo"),
            42,
            Bytes::from_static(b"hello"),
            None,
            1024 * 1024,
            responder,
        )
    }

    fn response_header(command: ConnectionCommand) -> FrameHeader {
        match command {
            ConnectionCommand::Respond { call_id, frame } => {
                assert_eq!(call_id, 42);
                let mut buffer = BytesMut::from(&frame[..]);
                decode_frame(&mut buffer, 1024 * 1024).unwrap().unwrap().header
            }
            _ => panic!("Expected a response command"),
        }
    }

    #[test]
    fn test_inbound_success_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let call = inbound(tx);
        let payload = call.payload().clone();
        call.respond_success(payload);

        let header = response_header(rx.try_recv().unwrap());
        assert_eq!(
            header,
            FrameHeader::Response {
                call_id: 42,
                error: None
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unanswered_inbound_call_fails_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(inbound(tx));

        match response_header(rx.try_recv().unwrap()) {
            FrameHeader::Response {
                error: Some(error), ..
            } => assert_eq!(error.code, ErrorCode::Unknown),
            other => panic!("Expected failure response, got {:?}", other),
        }
    }
}
