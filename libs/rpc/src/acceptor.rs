//! Acceptor
//!
//! Owns the listening sockets of a messenger. Addresses are bound eagerly by
//! [`Acceptor::listen`] so callers learn ephemeral ports immediately; accepting
//! starts only once [`Acceptor::start`] spawns the acceptor thread. Each
//! accepted socket is handed to the messenger, which routes it to a reactor.

use crate::messenger::MessengerInner;
use crate::{Result, RpcError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

enum AcceptorCommand {
    Listen(std::net::TcpListener, SocketAddr),
    Shutdown,
}

/// Listening sockets plus the thread accepting on them
pub(crate) struct Acceptor {
    name: String,
    bound: Mutex<Vec<SocketAddr>>,
    /// Bound before `start`, waiting for the acceptor thread
    pending: Mutex<Vec<(std::net::TcpListener, SocketAddr)>>,
    commands: Mutex<Option<mpsc::UnboundedSender<AcceptorCommand>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
    closing: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(messenger_name: &str) -> Self {
        Self {
            name: format!("{}_acceptor", messenger_name),
            bound: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            commands: Mutex::new(None),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Bind `addr` and return the resolved address.
    ///
    /// Binding an address with a concrete port that is already bound is a no-op.
    pub(crate) fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RpcError::illegal_state(format!(
                "Acceptor {} is shut down",
                self.name
            )));
        }
        if addr.port() != 0 && self.bound.lock().contains(&addr) {
            return Ok(addr);
        }

        let listener = std::net::TcpListener::bind(addr).map_err(|e| {
            RpcError::network_with_source(format!("Failed to bind {}", addr), Some(addr), e)
        })?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;

        // Hand straight to a running acceptor, otherwise park until start
        let listener = {
            let commands = self.commands.lock();
            match commands.as_ref() {
                Some(commands) => match commands.send(AcceptorCommand::Listen(listener, bound)) {
                    Ok(()) => None,
                    Err(_) => {
                        return Err(RpcError::illegal_state(format!(
                            "Acceptor {} is shut down",
                            self.name
                        )))
                    }
                },
                None => Some(listener),
            }
        };
        if let Some(listener) = listener {
            self.pending.lock().push((listener, bound));
        }

        self.bound.lock().push(bound);
        info!(acceptor = %self.name, address = %bound, "Listening");
        Ok(bound)
    }

    pub(crate) fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.bound.lock().clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.commands.lock().is_some()
    }

    /// Spawn the acceptor thread; a no-op if it is already running
    pub(crate) fn start(&self, messenger: Arc<MessengerInner>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RpcError::illegal_state(format!(
                "Acceptor {} is shut down",
                self.name
            )));
        }
        if self.bound.lock().is_empty() {
            return Err(RpcError::illegal_state(
                "Cannot start acceptor: no listen address bound",
            ));
        }

        let mut commands = self.commands.lock();
        if commands.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (listener, addr) in self.pending.lock().drain(..) {
            let _ = tx.send(AcceptorCommand::Listen(listener, addr));
        }

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
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
                runtime.block_on(run_acceptor(name, rx, messenger));
            })?;

        let _ = self.thread_id.set(handle.thread().id());
        *self.thread.lock() = Some(handle);
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(RpcError::illegal_state(format!(
                    "Acceptor {} exited during startup",
                    self.name
                )))
            }
        }

        *commands = Some(tx);
        info!(acceptor = %self.name, "Acceptor started");
        Ok(())
    }

    /// Stop accepting and close every listening socket
    pub(crate) fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(commands) = self.commands.lock().take() {
            let _ = commands.send(AcceptorCommand::Shutdown);
        }
        self.pending.lock().clear();

        let on_acceptor_thread = self.thread_id.get() == Some(&thread::current().id());
        if !on_acceptor_thread {
            let handle = self.thread.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(acceptor = %self.name, "Acceptor thread panicked");
                }
            }
        }
        info!(acceptor = %self.name, "Acceptor shut down");
    }
}

async fn run_acceptor(
    name: String,
    mut commands: mpsc::UnboundedReceiver<AcceptorCommand>,
    messenger: Arc<MessengerInner>,
) {
    let mut listeners = JoinSet::new();

    while let Some(command) = commands.recv().await {
        match command {
            AcceptorCommand::Listen(listener, addr) => match TcpListener::from_std(listener) {
                Ok(listener) => {
                    listeners.spawn(accept_loop(listener, addr, Arc::clone(&messenger)));
                }
                Err(e) => {
                    warn!(
                        acceptor = %name,
                        address = %addr,
                        error = %e,
                        "Failed to register listener"
                    );
                }
            },
            AcceptorCommand::Shutdown => break,
        }
    }

    listeners.shutdown().await;
    debug!(acceptor = %name, "Acceptor loop exited");
}

async fn accept_loop(listener: TcpListener, addr: SocketAddr, messenger: Arc<MessengerInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => match stream.into_std() {
                Ok(stream) => messenger.register_inbound_socket(stream, remote),
                Err(e) => {
                    warn!(
                        address = %addr,
                        remote = %remote,
                        error = %e,
                        "Failed to detach accepted socket"
                    );
                }
            },
            Err(e) => {
                // Typically descriptor exhaustion; retry shortly
                warn!(address = %addr, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_resolves_ephemeral_port() {
        let acceptor = Acceptor::new("unit");
        let bound = acceptor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(bound.port(), 0);

        // Rebinding the resolved address is idempotent
        assert_eq!(acceptor.listen(bound).unwrap(), bound);
        assert_eq!(acceptor.bound_addresses(), vec![bound]);
        assert!(!acceptor.is_started());
    }

    #[test]
    fn test_listen_after_shutdown_fails() {
        let acceptor = Acceptor::new("unit");
        acceptor.shutdown();
        assert!(matches!(
            acceptor.listen("127.0.0.1:0".parse().unwrap()),
            Err(RpcError::IllegalState { .. })
        ));
    }
}
