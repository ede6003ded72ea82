//! End-to-end tests over real loopback sockets.

use keeplink_wire::{
    Endpoint, EndpointConfig, ErrorKind, Listener, ListenerConfig, Observers, ProtocolConfig,
    WireError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

fn protocol() -> ProtocolConfig {
    ProtocolConfig {
        wait_trust_timeout_ms: 1_000,
        heartbeat_precision_ms: 10,
        ..Default::default()
    }
}

fn client_config(heartbeat_interval_ms: u64) -> EndpointConfig {
    EndpointConfig {
        heartbeat_interval_ms,
        protocol: protocol(),
    }
}

fn server_config(heartbeat_check_interval_ms: u64) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1".into(),
        heartbeat_check_interval_ms,
        protocol: protocol(),
        ..Default::default()
    }
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn connect_events() -> (Observers, UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observers = Observers::new().on_connect(move |ep| {
        let _ = tx.send(ep.id());
    });
    (observers, rx)
}

/// Accept one socket and answer the handshake by hand, assigning `id`.
async fn raw_passive_peer(listener: &TcpListener, id: u64) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut token = [0u8; 10];
    stream.read_exact(&mut token).await.unwrap();
    assert_eq!(&token, b"hello ztcp");
    stream.write_all(b"hello ztcp").await.unwrap();
    stream.write_all(&id.to_be_bytes()).await.unwrap();
    stream
}

#[tokio::test]
async fn test_both_sides_agree_on_sequential_ids() {
    let (server_observers, mut server_ids) = connect_events();
    let listener = Listener::bind(server_config(60_000), server_observers)
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    let mut clients = Vec::new();
    for expected in 1..=3u64 {
        let (observers, mut client_ids) = connect_events();
        let client = Endpoint::connect(addr.clone(), client_config(60_000), observers).unwrap();

        assert_eq!(next(&mut client_ids).await, expected);
        assert_eq!(next(&mut server_ids).await, expected);
        assert_eq!(client.id(), expected);
        clients.push(client);
    }

    assert_eq!(listener.registry().ids(), vec![1, 2, 3]);
    for (id, entry) in listener.registry().entries() {
        assert_eq!(entry.endpoint.id(), id);
        assert!(entry.endpoint.is_connected());
    }
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let (tx, mut received) = mpsc::unbounded_channel();
    let server_observers = Observers::new().on_receive(move |_, payload| {
        let _ = tx.send(payload.to_vec());
    });
    let listener = Listener::bind(server_config(60_000), server_observers)
        .await
        .unwrap();

    let (observers, mut connected) = connect_events();
    let client =
        Endpoint::connect(listener.local_addr().to_string(), client_config(60_000), observers)
            .unwrap();
    next(&mut connected).await;

    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        client.send(payload).await.unwrap();
    }
    assert_eq!(next(&mut received).await, b"one");
    assert_eq!(next(&mut received).await, b"two");
    assert_eq!(next(&mut received).await, b"three");
}

#[tokio::test]
async fn test_keepalives_hold_passive_side_open() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let (close_tx, mut closed) = mpsc::unbounded_channel::<()>();
    let server_observers = Observers::new()
        .on_receive(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move |_, _| {
            let _ = close_tx.send(());
        });
    // Server gives up after 300ms idle; the client pings every 50ms.
    let listener = Listener::bind(server_config(300), server_observers)
        .await
        .unwrap();

    let (observers, mut connected) = connect_events();
    let client =
        Endpoint::connect(listener.local_addr().to_string(), client_config(50), observers)
            .unwrap();
    let id = next(&mut connected).await;

    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(closed.try_recv().is_err(), "keepalives should reset the idle clock");
    assert_eq!(received.load(Ordering::SeqCst), 0, "keepalives are not delivered");
    assert!(client.is_connected());
    assert!(listener.endpoint(id).is_some_and(|ep| ep.is_connected()));
}

#[tokio::test]
async fn test_passive_side_closes_idle_connection() {
    let (close_tx, mut server_closed) = mpsc::unbounded_channel();
    let server_observers = Observers::new().on_close(move |ep, cause| {
        let _ = close_tx.send((ep.id(), cause.is_none()));
    });
    let listener = Listener::bind(server_config(100), server_observers)
        .await
        .unwrap();

    let (client_close_tx, mut client_closed) = mpsc::unbounded_channel();
    let (observers, mut connected) = connect_events();
    let observers = observers.on_close(move |_, cause| {
        let _ = client_close_tx.send(cause.is_none());
    });
    let client =
        Endpoint::connect(listener.local_addr().to_string(), client_config(60_000), observers)
            .unwrap();
    let id = next(&mut connected).await;

    assert_eq!(next(&mut server_closed).await, (id, true));
    assert!(listener.registry().is_empty());

    // The client sees an orderly EOF: closed without a cause.
    assert!(next(&mut client_closed).await);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_active_side_sends_one_keepalive_per_interval() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.local_addr().unwrap();

    let (observers, mut connected) = connect_events();
    let _client = Endpoint::connect(addr.to_string(), client_config(300), observers).unwrap();
    let mut peer = raw_passive_peer(&raw, 11).await;
    assert_eq!(next(&mut connected).await, 11);

    let mut header = [0u8; 4];
    timeout(Duration::from_secs(2), peer.read_exact(&mut header))
        .await
        .expect("no keepalive arrived")
        .unwrap();
    assert_eq!(header, [0, 0, 0, 0]);

    // Nothing more until the next interval elapses.
    let mut byte = [0u8; 1];
    assert!(timeout(Duration::from_millis(150), peer.read(&mut byte))
        .await
        .is_err());
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_peer() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.local_addr().unwrap();

    let (tx, mut closed) = mpsc::unbounded_channel();
    let observers = Observers::new().on_close(move |_, cause| {
        let _ = tx.send(cause.map(WireError::kind));
    });
    let config = EndpointConfig {
        heartbeat_interval_ms: 60_000,
        protocol: ProtocolConfig {
            wait_trust_timeout_ms: 200,
            ..protocol()
        },
    };

    let started = Instant::now();
    let client = Endpoint::connect(addr.to_string(), config, observers).unwrap();
    let (_silent, _) = raw.accept().await.unwrap();

    assert_eq!(next(&mut closed).await, Some(ErrorKind::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "closed early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "closed late: {elapsed:?}");
    assert!(client.is_closed());
    assert_eq!(client.id(), 0);
}

#[tokio::test]
async fn test_wrong_token_is_protocol_error() {
    let listener = Listener::bind(server_config(60_000), Observers::new())
        .await
        .unwrap();

    let (tx, mut closed) = mpsc::unbounded_channel();
    let observers = Observers::new().on_close(move |_, cause| {
        let _ = tx.send(cause.map(WireError::kind));
    });
    let config = EndpointConfig {
        heartbeat_interval_ms: 60_000,
        protocol: ProtocolConfig {
            trust_token: "hello zzzz".into(),
            ..protocol()
        },
    };
    let _client = Endpoint::connect(listener.local_addr().to_string(), config, observers).unwrap();

    // The server drops the socket on mismatch; the client sees EOF mid-handshake.
    assert_eq!(next(&mut closed).await, Some(ErrorKind::Connection));
    assert!(listener.registry().is_empty());
    assert_eq!(listener.ids().last_issued(), 0);
}

#[tokio::test]
async fn test_oversized_frame_closes_with_cause() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.local_addr().unwrap();

    let (tx, mut closed) = mpsc::unbounded_channel();
    let (observers, mut connected) = connect_events();
    let observers = observers.on_close(move |_, cause| {
        let _ = tx.send(matches!(cause, Some(WireError::FrameTooLarge { .. })));
    });
    let client = Endpoint::connect(addr.to_string(), client_config(60_000), observers).unwrap();
    let mut peer = raw_passive_peer(&raw, 1).await;
    next(&mut connected).await;

    peer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    assert!(next(&mut closed).await);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_send_all_reaches_every_live_endpoint() {
    let listener = Listener::bind(server_config(60_000), Observers::new())
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    let inboxes: Vec<Arc<Mutex<Vec<Vec<u8>>>>> = (0..5).map(|_| Arc::default()).collect();
    let (tx, mut got_frame) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for inbox in &inboxes {
        let inbox = Arc::clone(inbox);
        let tx = tx.clone();
        let (observers, mut connected) = connect_events();
        let observers = observers.on_receive(move |_, payload| {
            inbox.lock().unwrap().push(payload.to_vec());
            let _ = tx.send(());
        });
        clients.push(Endpoint::connect(addr.clone(), client_config(60_000), observers).unwrap());
        next(&mut connected).await;
    }

    // A broken entry: an endpoint stuck before the handshake.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stuck = Endpoint::connect(
        silent.local_addr().unwrap().to_string(),
        client_config(60_000),
        Observers::new(),
    )
    .unwrap();
    listener.registry().insert(Arc::clone(&stuck));

    let results = listener.send_all(&b"broadcast"[..]).unwrap().wait().await;
    assert_eq!(results.len(), 6);
    let failures: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 0);

    for _ in 0..5 {
        next(&mut got_frame).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for inbox in &inboxes {
        assert_eq!(*inbox.lock().unwrap(), vec![b"broadcast".to_vec()]);
    }
}

#[tokio::test]
async fn test_close_all_disconnects_clients() {
    let listener = Listener::bind(server_config(60_000), Observers::new())
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();

    let closes = Arc::new(AtomicUsize::new(0));
    let (tx, mut closed) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let closes = Arc::clone(&closes);
        let tx = tx.clone();
        let (observers, mut connected) = connect_events();
        let observers = observers.on_close(move |_, cause| {
            closes.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(cause.is_none());
        });
        clients.push(Endpoint::connect(addr.clone(), client_config(60_000), observers).unwrap());
        next(&mut connected).await;
    }

    let results = listener.close_all().wait().await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(listener.registry().is_empty());

    for _ in 0..3 {
        assert!(next(&mut closed).await);
    }
    // A second close on an already-closed client does not notify again.
    clients[0].close().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 3);

    listener.close().await.unwrap();
    assert!(listener.is_closed());
}

#[tokio::test]
async fn test_concurrent_close_notifies_once() {
    let listener = Listener::bind(server_config(60_000), Observers::new())
        .await
        .unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let (observers, mut connected) = connect_events();
    let observers = observers.on_close(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let client =
        Endpoint::connect(listener.local_addr().to_string(), client_config(60_000), observers)
            .unwrap();
    next(&mut connected).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.close().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    client.closed().await;

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        client.send(b"late").await,
        Err(WireError::NotReady { .. })
    ));
}
