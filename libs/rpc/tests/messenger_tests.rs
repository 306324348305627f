//! Messenger Integration Tests
//!
//! End-to-end behaviour of the messenger over real loopback connections:
//! call outcomes, fault injection, delayed tasks, diagnostics and shutdown.

mod common;

use bytes::Bytes;
use common::*;
use rpc::{ConnectionId, ErrorCode, MessengerBuilder, OutboundCall, RemoteMethod, RpcError};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

mod calls {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let (server, addr, _service) = start_server("echo-server");
        let client = start_client("echo-client");

        let response = echo(&client, addr, b"hello").unwrap();
        assert_eq!(&response[..], b"hello");

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.outbound_calls_succeeded, 1);
        assert_eq!(snapshot.connections_established, 1);
        assert_eq!(server.metrics().snapshot().inbound_calls_received, 1);
    }

    #[test]
    fn test_unknown_service_fails_remotely() {
        let (_server, addr, _service) = start_server("ts-missing");
        let client = start_client("missing-client");

        let err = call_and_wait(
            &client,
            addr,
            RemoteMethod::new("nope", "Echo"),
            b"",
            Duration::from_secs(5),
        )
        .unwrap_err();

        match err {
            RpcError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::NoSuchService);
                assert!(message.contains("Service nope not registered on ts-missing"));
            }
            other => panic!("Expected remote failure, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_reports_service_error() {
        let (_server, addr, _service) = start_server("method-server");
        let client = start_client("method-client");

        let err = call_and_wait(
            &client,
            addr,
            RemoteMethod::new(TEST_SERVICE, "Missing"),
            b"",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote {
                code: ErrorCode::NoSuchMethod,
                ..
            }
        ));
    }

    #[test]
    fn test_call_times_out_against_silent_peer() {
        init_tracing();
        // Accepts at the kernel level but never answers
        let silent = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let client = start_client("timeout-client");

        let start = Instant::now();
        let err = call_and_wait(
            &client,
            addr,
            RemoteMethod::new(TEST_SERVICE, "Echo"),
            b"ping",
            Duration::from_millis(50),
        )
        .unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "Timeout took {:?}", elapsed);
        assert_eq!(client.metrics().snapshot().outbound_calls_timed_out, 1);
    }

    #[test]
    fn test_timeout_fires_while_write_is_blocked() {
        init_tracing();
        // Accepted by the kernel but never read, so a large frame fills the socket buffers
        let stalled = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = stalled.local_addr().unwrap();
        let client = MessengerBuilder::new("stalled-client")
            .num_reactors(1)
            .build()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        client.call(
            addr,
            RemoteMethod::new(TEST_SERVICE, "Echo"),
            Bytes::from(vec![0u8; 12 * 1024 * 1024]),
            Duration::from_millis(50),
            move |result| {
                let _ = tx.send(result);
            },
        );

        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        let elapsed = start.elapsed();
        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);
        assert!(elapsed < Duration::from_secs(2), "Timeout took {:?}", elapsed);

        // The same reactor keeps serving other work while the write is stuck
        let (fired_tx, fired_rx) = mpsc::channel();
        client.schedule_on_reactor_detached(Duration::ZERO, move |result| {
            let _ = fired_tx.send(result.is_ok());
        });
        assert!(fired_rx.recv_timeout(Duration::from_secs(2)).unwrap());

        let start = Instant::now();
        client.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(stalled);
    }

    #[test]
    fn test_connect_refused_is_network_error() {
        init_tracing();
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = start_client("refused-client");

        let err = echo(&client, addr, b"ping").unwrap_err();
        assert!(
            matches!(err, RpcError::Network { .. }),
            "Expected network error, got {:?}",
            err
        );
    }

    #[test]
    fn test_calls_on_one_connection_dispatch_in_order() {
        let (_server, addr, service) = start_server("order-server");
        let client = start_client("order-client");
        let (tx, rx) = mpsc::channel();

        for seq in 0u32..50 {
            let tx = tx.clone();
            let call = OutboundCall::new(
                ConnectionId::new(addr, 0),
                RemoteMethod::new(TEST_SERVICE, "Record"),
                Bytes::copy_from_slice(&seq.to_be_bytes()),
                Duration::from_secs(5),
                move |result| {
                    let _ = tx.send(result.is_ok());
                },
            );
            client.queue_outbound_call(call);
        }
        for _ in 0..50 {
            assert!(rx.recv_timeout(WAIT).unwrap());
        }

        let recorded: Vec<u32> = service
            .recorded
            .lock()
            .iter()
            .map(|payload| u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
            .collect();
        assert_eq!(recorded, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_malformed_preamble_closes_only_that_connection() {
        let (_server, addr, _service) = start_server("preamble-server");
        let client = start_client("preamble-client");
        assert!(echo(&client, addr, b"before").is_ok());

        let mut raw = TcpStream::connect(addr).unwrap();
        raw.set_read_timeout(Some(WAIT)).unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut buffer = [0u8; 64];
        match raw.read(&mut buffer) {
            Ok(n) => assert_eq!(n, 0, "Server answered garbage"),
            Err(e) => assert_ne!(
                e.kind(),
                std::io::ErrorKind::WouldBlock,
                "Server kept connection open"
            ),
        }

        let response = echo(&client, addr, b"after").unwrap();
        assert_eq!(&response[..], b"after");
    }
}

mod fault_injection {
    use super::*;

    #[test]
    fn test_broken_connectivity_fails_without_connecting() {
        let (server, addr, _service) = start_server("fi-server");
        let client = start_client("fi-client");

        client.break_connectivity_with(LOCALHOST);
        assert!(client.is_artificially_disconnected_from(LOCALHOST));

        match echo(&client, addr, b"ping").unwrap_err() {
            RpcError::Network { message, .. } => {
                assert!(message.contains("Connectivity is broken"));
            }
            other => panic!("Expected network error, got {:?}", other),
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.metrics().snapshot().connections_accepted, 0);

        client.restore_connectivity_with(LOCALHOST);
        assert!(!client.is_artificially_disconnected_from(LOCALHOST));
        assert_eq!(&echo(&client, addr, b"ping").unwrap()[..], b"ping");
    }

    #[test]
    fn test_break_drops_existing_connections() {
        let (_server, addr, _service) = start_server("fi-drop-server");
        let client = start_client("fi-drop-client");
        assert!(echo(&client, addr, b"warm").is_ok());

        client.break_connectivity_with(LOCALHOST);
        client.restore_connectivity_with(LOCALHOST);

        // The old connection was dropped; a fresh one serves the next call
        assert!(echo(&client, addr, b"again").is_ok());
        assert!(wait_until(|| {
            client.metrics().snapshot().connections_established >= 2
        }));
    }

    #[test]
    fn test_server_rejects_broken_remote() {
        let (server, addr, _service) = start_server("fi-reject-server");
        let client = start_client("fi-reject-client");

        server.break_connectivity_with(LOCALHOST);
        let err = echo(&client, addr, b"ping").unwrap_err();
        assert!(
            matches!(err, RpcError::Network { .. }),
            "Expected network error, got {:?}",
            err
        );
        assert!(server.metrics().snapshot().connections_rejected >= 1);
    }
}

mod scheduling {
    use super::*;

    #[test]
    fn test_abort_before_fire_prevents_body() {
        let messenger = start_client("sched-abort");
        let (tx, rx) = mpsc::channel();

        let id = messenger.schedule_on_reactor(Duration::from_millis(200), move |result| {
            let _ = tx.send(result);
        });
        assert!(messenger.abort_on_reactor(id));

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(RpcError::Aborted { .. })
        ));
        // Neither the body nor a second abort ever arrives
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_abort_after_fire_is_noop() {
        let messenger = start_client("sched-late");
        let (tx, rx) = mpsc::channel();

        let id = messenger.schedule_on_reactor(Duration::from_millis(1), move |result| {
            let _ = tx.send(result.is_ok());
        });
        assert!(rx.recv_timeout(WAIT).unwrap());

        assert!(!messenger.abort_on_reactor(id));
        assert!(!messenger.abort_on_reactor(9_999));
    }

    #[test]
    fn test_tracked_ids_are_unique() {
        let messenger = start_client("sched-ids");
        let ids: Vec<_> = (0..10)
            .map(|_| messenger.schedule_on_reactor(Duration::from_secs(60), |_| {}))
            .collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| *id >= 1));
    }

    #[test]
    fn test_dropping_last_handle_aborts_tracked_task() {
        let messenger = start_client("sched-drop");
        let (tx, rx) = mpsc::channel();

        messenger.schedule_on_reactor(Duration::from_secs(60), move |result| {
            let _ = tx.send(result);
        });
        drop(messenger);

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(RpcError::Aborted { .. })
        ));
    }

    #[test]
    fn test_shared_scheduler_runs_on_io_pool() {
        let messenger = start_client("sched-pool");
        let (tx, rx) = mpsc::channel();

        messenger
            .scheduler()
            .schedule(Duration::from_millis(5), move |result| {
                let name = thread::current().name().map(str::to_string);
                let _ = tx.send((result.is_ok(), name));
            });

        let (ok, thread_name) = rx.recv_timeout(WAIT).unwrap();
        assert!(ok);
        assert_eq!(thread_name.as_deref(), Some("sched-pool_iotp"));
    }
}

mod diagnostics {
    use super::*;

    #[test]
    fn test_dump_running_rpcs_lists_held_call() {
        let (server, addr, service) = start_server("dump-server");
        let client = start_client("dump-client");
        let (tx, rx) = mpsc::channel();

        client.call(
            addr,
            RemoteMethod::new(TEST_SERVICE, "Hold"),
            Bytes::from_static(b"slow"),
            Duration::ZERO,
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert!(wait_until(|| !service.held.lock().is_empty()));

        let server_dump = server.dump_running_rpcs().unwrap();
        assert_eq!(server_dump.total_calls(), 1);
        let held = &server_dump.inbound_connections[0].calls_in_flight[0];
        assert_eq!(held.service, TEST_SERVICE);
        assert_eq!(held.method, "Hold");

        let client_dump = client.dump_running_rpcs().unwrap();
        assert_eq!(client_dump.outbound_connections.len(), 1);
        assert_eq!(client_dump.outbound_connections[0].calls_in_flight.len(), 1);
        assert_eq!(client_dump.outbound_connections[0].state, "open");

        let call = service.held.lock().pop().unwrap();
        call.respond_success(Bytes::from_static(b"done"));
        assert_eq!(&rx.recv_timeout(WAIT).unwrap().unwrap()[..], b"done");
        assert!(wait_until(|| server.dump_running_rpcs().unwrap().total_calls() == 0));
    }

    #[test]
    fn test_dropped_inbound_call_fails_client() {
        let (_server, addr, service) = start_server("drop-call-server");
        let client = start_client("drop-call-client");
        let (tx, rx) = mpsc::channel();

        client.call(
            addr,
            RemoteMethod::new(TEST_SERVICE, "Hold"),
            Bytes::new(),
            Duration::ZERO,
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert!(wait_until(|| !service.held.lock().is_empty()));
        service.held.lock().clear();

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(RpcError::Remote {
                code: ErrorCode::Unknown,
                ..
            })
        ));
    }

    #[test]
    fn test_server_event_reaches_client_listener() {
        let (server, addr, _service) = start_server("event-server");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let client = MessengerBuilder::new("event-client")
            .num_reactors(1)
            .server_event_listener(move |remote, payload| {
                let _ = tx.lock().unwrap().send((remote, payload));
            })
            .build()
            .unwrap();

        assert!(echo(&client, addr, b"connect").is_ok());
        server.queue_event_on_all_reactors(b"leader-changed").unwrap();

        let (remote, payload) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(remote, addr);
        assert_eq!(&payload[..], b"leader-changed");
    }

    #[test]
    fn test_idle_server_connection_closed() {
        let (server, addr, _service) = start_server_with(
            MessengerBuilder::new("idle-server")
                .num_reactors(1)
                .connection_keepalive(Duration::from_millis(100))
                .coarse_timer_granularity(Duration::from_millis(20)),
        );
        let client = start_client("idle-client");

        assert!(echo(&client, addr, b"once").is_ok());
        assert!(wait_until(|| server.metrics().snapshot().connections_closed >= 1));

        // The client notices and reconnects on demand
        assert!(wait_until(|| client.metrics().snapshot().connections_closed >= 1));
        assert!(echo(&client, addr, b"twice").is_ok());
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_acceptor_without_listen_address() {
        let messenger = start_client("no-listen");
        assert!(matches!(
            messenger.start_acceptor(),
            Err(RpcError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_shutdown_acceptor_keeps_messenger_running() {
        let (server, addr, _service) = start_server("acceptor-server");
        let client = start_client("acceptor-client");
        assert!(server.is_accepting());
        assert_eq!(server.bound_addresses(), vec![addr]);

        server.shutdown_acceptor();
        assert!(!server.is_accepting());
        assert!(server.bound_addresses().is_empty());
        assert!(!server.is_closing());

        // Listening socket is gone, so new connections are refused
        assert!(matches!(
            echo(&client, addr, b"ping").unwrap_err(),
            RpcError::Network { .. }
        ));

        let rebound = server.listen_address("127.0.0.1:0".parse().unwrap()).unwrap();
        server.start_acceptor().unwrap();
        assert_eq!(&echo(&client, rebound, b"back").unwrap()[..], b"back");
    }

    #[test]
    fn test_service_registration_conflicts() {
        let (server, _addr, service) = start_server("reg-server");

        assert!(matches!(
            server.register_service(TEST_SERVICE, service.clone()),
            Err(RpcError::AlreadyPresent { .. })
        ));
        assert!(matches!(
            server.unregister_service("absent"),
            Err(RpcError::ServiceUnavailable { .. })
        ));

        server.unregister_service(TEST_SERVICE).unwrap();
        server.register_service(TEST_SERVICE, service).unwrap();
    }

    #[test]
    fn test_unregistered_service_stops_dispatch() {
        let (server, addr, _service) = start_server("unreg-server");
        let client = start_client("unreg-client");
        assert!(echo(&client, addr, b"before").is_ok());

        server.unregister_all_services();
        assert!(matches!(
            echo(&client, addr, b"after").unwrap_err(),
            RpcError::Remote {
                code: ErrorCode::NoSuchService,
                ..
            }
        ));
    }

    #[test]
    fn test_concurrent_shutdown() {
        let messenger = start_client("concurrent-shutdown");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let messenger = messenger.clone();
                thread::spawn(move || messenger.shutdown())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(messenger.is_closing());
        assert_eq!(messenger.running_reactor_threads(), 0);
        messenger.shutdown();
    }

    #[test]
    fn test_operations_after_shutdown() {
        let (server, addr, service) = start_server("closed-server");
        server.shutdown();

        assert_eq!(server.running_reactor_threads(), 0);
        assert!(matches!(
            server.register_service("other", service),
            Err(RpcError::IllegalState { .. })
        ));
        assert!(matches!(
            server.listen_address("127.0.0.1:0".parse().unwrap()),
            Err(RpcError::IllegalState { .. })
        ));
        assert!(matches!(
            server.start_acceptor(),
            Err(RpcError::IllegalState { .. })
        ));

        // Calls still reach exactly one outcome
        let err = echo(&server, addr, b"late").unwrap_err();
        assert!(matches!(err, RpcError::ServiceUnavailable { .. }));
        assert!(server.dump_running_rpcs().unwrap().inbound_connections.is_empty());
    }

    #[test]
    fn test_shutdown_fails_pending_calls() {
        let (_server, addr, service) = start_server("pending-server");
        let client = start_client("pending-client");
        let (tx, rx) = mpsc::channel();

        client.call(
            addr,
            RemoteMethod::new(TEST_SERVICE, "Hold"),
            Bytes::new(),
            Duration::ZERO,
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert!(wait_until(|| !service.held.lock().is_empty()));

        client.shutdown();
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(
            matches!(err, RpcError::ServiceUnavailable { .. }),
            "Expected shutdown failure, got {:?}",
            err
        );
    }

    #[test]
    fn test_shutdown_from_reactor_callback() {
        let messenger = start_client("reentrant-shutdown");
        let (tx, rx) = mpsc::channel();

        let inner = messenger.clone();
        messenger.schedule_on_reactor_detached(Duration::ZERO, move |_| {
            inner.shutdown();
            let _ = tx.send(inner.is_closing());
            // Keep this reactor thread alive past the outer shutdown call
            thread::sleep(Duration::from_millis(300));
        });

        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(messenger.is_closing());

        // The outer call joins the reactor the inner sequence could not
        messenger.shutdown();
        assert_eq!(messenger.running_reactor_threads(), 0);
    }

    #[test]
    fn test_shared_metrics_sink() {
        init_tracing();
        let metrics = Arc::new(rpc::MessengerMetrics::new());
        let (_server, addr, _service) = start_server("metrics-server");

        for name in ["metrics-a", "metrics-b"] {
            let client = MessengerBuilder::new(name)
                .num_reactors(1)
                .metrics(Arc::clone(&metrics))
                .build()
                .unwrap();
            assert!(echo(&client, addr, b"count me").is_ok());
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outbound_calls_queued, 2);
        assert_eq!(snapshot.outbound_calls_succeeded, 2);
    }
}
