//! Common Test Utilities
//!
//! Shared services and helpers for the messenger integration suites.
//! Everything runs over real loopback sockets.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use rpc::{
    ErrorCode, InboundCall, Messenger, MessengerBuilder, RemoteMethod, Result, RpcError,
    RpcService,
};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const TEST_SERVICE: &str = "test";
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `Echo` echoes, `Hold` parks the call, `Record` logs the payload then acks
#[derive(Default)]
pub struct TestService {
    pub held: Mutex<Vec<InboundCall>>,
    pub recorded: Mutex<Vec<Bytes>>,
}

impl RpcService for TestService {
    fn handle(&self, call: InboundCall) {
        match call.method_name() {
            "Echo" => {
                let payload = call.payload().clone();
                call.respond_success(payload);
            }
            "Hold" => self.held.lock().push(call),
            "Record" => {
                self.recorded.lock().push(call.payload().clone());
                call.respond_success(Bytes::new());
            }
            other => {
                let message = format!("No method {}", other);
                let error = RpcError::remote(ErrorCode::NoSuchMethod, message);
                call.respond_failure(ErrorCode::NoSuchMethod, &error);
            }
        }
    }
}

/// Messenger listening on an ephemeral loopback port with [`TestService`]
pub fn start_server(name: &str) -> (Messenger, SocketAddr, Arc<TestService>) {
    start_server_with(MessengerBuilder::new(name).num_reactors(2))
}

pub fn start_server_with(builder: MessengerBuilder) -> (Messenger, SocketAddr, Arc<TestService>) {
    init_tracing();
    let messenger = builder.build().unwrap();
    let service = Arc::new(TestService::default());
    messenger
        .register_service(TEST_SERVICE, service.clone())
        .unwrap();
    let addr = messenger
        .listen_address("127.0.0.1:0".parse().unwrap())
        .unwrap();
    messenger.start_acceptor().unwrap();
    (messenger, addr, service)
}

pub fn start_client(name: &str) -> Messenger {
    init_tracing();
    MessengerBuilder::new(name).num_reactors(2).build().unwrap()
}

/// Send one call and block until its single outcome arrives
pub fn call_and_wait(
    messenger: &Messenger,
    remote: SocketAddr,
    method: RemoteMethod,
    payload: &'static [u8],
    timeout: Duration,
) -> Result<Bytes> {
    let (tx, rx) = mpsc::channel();
    messenger.call(remote, method, Bytes::from_static(payload), timeout, move |result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(WAIT).expect("call never completed")
}

pub fn echo(messenger: &Messenger, remote: SocketAddr, payload: &'static [u8]) -> Result<Bytes> {
    call_and_wait(
        messenger,
        remote,
        RemoteMethod::new(TEST_SERVICE, "Echo"),
        payload,
        Duration::from_secs(5),
    )
}

/// Poll `condition` until it holds or `WAIT` elapses
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
