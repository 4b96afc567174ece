use async_trait::async_trait;
use berth::{
    Connection, ConnectionHandle, Directive, ErrorKind, Handler, Message, Server, ServerConfig,
    ServerConfigBuilder, TelemetryEvent,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::assert_ok;

/// Echoes every chunk back to the peer.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }
}

fn echo() -> Box<dyn Handler> {
    Box::new(Echo)
}

async fn start_server<F>(factory: F) -> Server
where
    F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
{
    start_server_with(factory, |builder| builder).await
}

async fn start_server_with<F, C>(factory: F, configure: C) -> Server
where
    F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    C: FnOnce(ServerConfigBuilder) -> ServerConfigBuilder,
{
    // A short default drain budget keeps a leaked client from stalling a
    // test for the full production default; individual tests override it.
    let builder = ServerConfig::builder()
        .host("127.0.0.1".parse().unwrap())
        .port(0)
        .shutdown_timeout(Duration::from_secs(2))
        .handler(factory);
    let config = configure(builder).build().unwrap();
    Server::start(config).await.unwrap()
}

/// Poll until `cond` holds; panics if it never does.
async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn ephemeral_port_is_reported_and_accepting() {
    let server = start_server(echo).await;
    let info = server.listener_info();
    assert!(info.port > 0);
    assert_eq!(info.transport, "tcp");

    let mut stream = TcpStream::connect(info.local_addr).await.unwrap();
    assert_ok!(stream.write_all(b"PING").await);
    let mut buf = [0u8; 4];
    assert_ok!(stream.read_exact(&mut buf).await);
    assert_eq!(b"PING", &buf);

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn concurrent_clients_are_isolated() {
    let server = start_server(echo).await;
    let addr = server.listener_info().local_addr;

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();

    a.write_all(b"HELLO").await.unwrap();
    b.write_all(b"BONJOUR").await.unwrap();

    // Read B before A: each connection is served independently.
    let mut buf_b = [0u8; 7];
    b.read_exact(&mut buf_b).await.unwrap();
    assert_eq!(b"BONJOUR", &buf_b);

    let mut buf_a = [0u8; 5];
    a.read_exact(&mut buf_a).await.unwrap();
    assert_eq!(b"HELLO", &buf_a);

    drop(a);
    drop(b);
    server.stop().await;
}

#[tokio::test]
async fn drain_refuses_new_connections_but_serves_in_flight() {
    let server =
        start_server_with(echo, |builder| builder.shutdown_timeout(Duration::from_secs(5))).await;
    let addr = server.listener_info().local_addr;

    let mut existing = TcpStream::connect(addr).await.unwrap();
    existing.write_all(b"WARM").await.unwrap();
    let mut buf = [0u8; 4];
    existing.read_exact(&mut buf).await.unwrap();

    let stop = tokio::spawn(server.stop());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let refused = TcpStream::connect(addr).await;
    assert!(
        refused.is_err(),
        "new connections must be refused once drain begins"
    );

    // The pre-existing connection is still served.
    existing.write_all(b"HELLO").await.unwrap();
    let mut buf = [0u8; 5];
    existing.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"HELLO", &buf);

    drop(existing);
    stop.await.unwrap();
}

/// Says goodbye when the server drains.
struct Goodbye;

#[async_trait]
impl Handler for Goodbye {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }

    async fn handle_shutdown(&mut self, conn: &mut Connection) -> Directive {
        match conn.send(b"GOODBYE").await {
            Ok(()) => Directive::Close,
            Err(err) => Directive::Error(err),
        }
    }
}

#[tokio::test]
async fn goodbye_is_delivered_on_drain() {
    let server = start_server(|| Box::new(Goodbye) as Box<dyn Handler>).await;
    let addr = server.listener_info().local_addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"HI").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();

    let stop = tokio::spawn(server.stop());

    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"GOODBYE", &buf);

    // Orderly close after the goodbye.
    let mut rest = [0u8; 1];
    let n = client.read(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    stop.await.unwrap();
}

#[tokio::test]
async fn drain_budget_forces_stragglers() {
    let server = start_server_with(echo, |builder| {
        builder.shutdown_timeout(Duration::from_millis(500))
    })
    .await;
    let addr = server.listener_info().local_addr;

    // This client never closes; the default handle_shutdown keeps the
    // connection running, so only the budget can end it.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"WARM").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    let started = Instant::now();
    server.stop().await;
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(400),
        "stop returned before the drain budget: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "stop did not enforce the drain budget: {elapsed:?}"
    );

    // The forced close is visible to the peer.
    let mut rest = [0u8; 1];
    match client.read(&mut rest).await {
        Ok(n) => assert_eq!(n, 0),
        Err(_reset) => {}
    }
}

#[tokio::test]
async fn stop_with_timeout_overrides_the_drain_budget() {
    // The configured budget is far too long; the override must win.
    let server = start_server_with(echo, |builder| {
        builder.shutdown_timeout(Duration::from_secs(30))
    })
    .await;
    let addr = server.listener_info().local_addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"WARM").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    let started = Instant::now();
    server.stop_with_timeout(Duration::from_millis(300)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
}

fn telemetry_sink() -> (
    Arc<Mutex<Vec<TelemetryEvent>>>,
    impl Fn(&TelemetryEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, move |event: &TelemetryEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}

#[tokio::test]
async fn telemetry_lifecycle_for_an_idle_server() {
    let (events, hook) = telemetry_sink();
    let server = start_server_with(echo, move |builder| builder.telemetry_hook(hook)).await;
    server.stop().await;

    let events = events.lock().unwrap();
    assert!(
        matches!(events.first(), Some(TelemetryEvent::ListenerStart { port, .. }) if *port > 0),
        "first event must be listener.start with the bound port"
    );

    let listener_events: Vec<&str> = events
        .iter()
        .filter(|event| event.name().starts_with("listener."))
        .map(|event| event.name())
        .collect();
    assert_eq!(listener_events, ["listener.start", "listener.shutdown"]);

    let starts = events
        .iter()
        .filter(|event| event.name() == "connection.start")
        .count();
    let closes = events
        .iter()
        .filter(|event| event.name() == "connection.close")
        .count();
    assert_eq!(starts, 0);
    assert_eq!(closes, 0);
}

#[tokio::test]
async fn connection_telemetry_balances_at_quiescence() {
    let (events, hook) = telemetry_sink();
    let server = start_server_with(echo, move |builder| builder.telemetry_hook(hook)).await;
    let addr = server.listener_info().local_addr;

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
    }

    {
        let events = events.clone();
        wait_for("connection.close events", move || {
            let events = events.lock().unwrap();
            events
                .iter()
                .filter(|event| event.name() == "connection.close")
                .count()
                == 3
        })
        .await;
    }

    server.stop().await;

    let events = events.lock().unwrap();
    let starts = events
        .iter()
        .filter(|event| event.name() == "connection.start")
        .count();
    let closes = events
        .iter()
        .filter(|event| event.name() == "connection.close")
        .count();
    assert_eq!(starts, 3);
    assert_eq!(closes, 3);
}

/// Counts lifecycle callbacks and flags any overlapping invocation.
struct Recording {
    in_callback: AtomicBool,
    overlaps: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl Recording {
    fn enter(&self) {
        if self.in_callback.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.in_callback.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Handler for Recording {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        self.enter();
        // Widen the window so an overlapping invocation would be caught.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = conn.send(&data).await;
        self.exit();
        match result {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }

    async fn handle_close(&mut self, _conn: &mut Connection) {
        self.enter();
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.exit();
    }

    async fn handle_error(&mut self, _error: &berth::Error, _conn: &mut Connection) {
        self.enter();
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.exit();
    }
}

#[tokio::test]
async fn callbacks_are_serialized_and_close_is_exactly_once() {
    let overlaps = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let server = {
        let overlaps = overlaps.clone();
        let closes = closes.clone();
        let errors = errors.clone();
        start_server(move || {
            Box::new(Recording {
                in_callback: AtomicBool::new(false),
                overlaps: overlaps.clone(),
                closes: closes.clone(),
                errors: errors.clone(),
            }) as Box<dyn Handler>
        })
        .await
    };
    let addr = server.listener_info().local_addr;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            for _ in 0..5 {
                client.write_all(b"CHUNK").await.unwrap();
                let mut buf = [0u8; 5];
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(b"CHUNK", &buf);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    {
        let closes = closes.clone();
        wait_for("all connections to close", move || {
            closes.load(Ordering::SeqCst) == 8
        })
        .await;
    }

    server.stop().await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 8);
    assert_eq!(errors.load(Ordering::SeqCst), 0, "no abnormal terminations");
}

/// Publishes its mailbox handle and relays numeric messages to the peer.
struct Mailbox {
    slot: Arc<Mutex<Option<ConnectionHandle>>>,
}

#[async_trait]
impl Handler for Mailbox {
    async fn start(&mut self, conn: &mut Connection) -> Directive {
        *self.slot.lock().unwrap() = Some(conn.handle());
        Directive::Continue
    }

    async fn handle_message(&mut self, msg: Message, conn: &mut Connection) -> Directive {
        let Ok(number) = msg.downcast::<u32>() else {
            return Directive::Continue;
        };
        match conn.send(number.to_string().as_bytes()).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }
}

#[tokio::test]
async fn mailbox_messages_are_delivered_in_order() {
    let slot: Arc<Mutex<Option<ConnectionHandle>>> = Arc::new(Mutex::new(None));

    let server = {
        let slot = slot.clone();
        start_server(move || Box::new(Mailbox { slot: slot.clone() }) as Box<dyn Handler>).await
    };
    let addr = server.listener_info().local_addr;

    let mut client = TcpStream::connect(addr).await.unwrap();

    {
        let slot = slot.clone();
        wait_for("the handler to publish its handle", move || {
            slot.lock().unwrap().is_some()
        })
        .await;
    }
    let handle = slot.lock().unwrap().clone().unwrap();

    for number in 1u32..=3 {
        assert!(handle.send(Box::new(number)).await.is_ok());
    }

    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"123", &buf);

    drop(client);
    server.stop().await;
}

/// Panics on demand; otherwise echoes.
struct Panicky {
    errors: Arc<Mutex<Vec<ErrorKind>>>,
}

#[async_trait]
impl Handler for Panicky {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        if &data[..] == b"BOOM" {
            panic!("boom");
        }
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }

    async fn handle_error(&mut self, error: &berth::Error, _conn: &mut Connection) {
        self.errors.lock().unwrap().push(error.kind());
    }
}

#[tokio::test]
async fn handler_panic_is_isolated_to_its_connection() {
    let errors: Arc<Mutex<Vec<ErrorKind>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let errors = errors.clone();
        start_server(move || Box::new(Panicky { errors: errors.clone() }) as Box<dyn Handler>)
            .await
    };
    let addr = server.listener_info().local_addr;

    let mut victim = TcpStream::connect(addr).await.unwrap();
    victim.write_all(b"BOOM").await.unwrap();
    let mut buf = [0u8; 1];
    match victim.read(&mut buf).await {
        Ok(n) => assert_eq!(n, 0),
        Err(_reset) => {}
    }

    {
        let errors = errors.clone();
        wait_for("handle_error to run", move || {
            !errors.lock().unwrap().is_empty()
        })
        .await;
    }
    assert_eq!(errors.lock().unwrap().as_slice(), &[ErrorKind::HandlerPanic]);

    // The crash is isolated: the server still serves new connections.
    let mut survivor = TcpStream::connect(addr).await.unwrap();
    survivor.write_all(b"HELLO").await.unwrap();
    let mut buf = [0u8; 5];
    survivor.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"HELLO", &buf);

    drop(victim);
    drop(survivor);
    server.stop().await;
}

/// Upper-cases everything after an upgrade.
struct Shouting;

#[async_trait]
impl Handler for Shouting {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data.to_ascii_uppercase()).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }
}

/// Echoes until the peer asks to upgrade, then switches handlers.
struct Plain;

#[async_trait]
impl Handler for Plain {
    async fn handle_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        if &data[..] == b"UPGRADE" {
            return match conn.send(b"OK").await {
                Ok(()) => Directive::Switch(Box::new(Shouting)),
                Err(err) => Directive::Error(err),
            };
        }
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(err) => Directive::Error(err),
        }
    }
}

#[tokio::test]
async fn switch_hands_the_connection_to_a_new_handler() {
    let server = start_server(|| Box::new(Plain) as Box<dyn Handler>).await;
    let addr = server.listener_info().local_addr;

    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"hello", &buf);

    client.write_all(b"UPGRADE").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"OK", &buf);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"HELLO", &buf);

    drop(client);
    server.stop().await;
}

/// Closes with a marker on its first read timeout.
struct Impatient {
    fired: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Impatient {
    async fn start(&mut self, _conn: &mut Connection) -> Directive {
        Directive::ContinueFor(Duration::from_millis(50))
    }

    async fn handle_timeout(&mut self, conn: &mut Connection) -> Directive {
        self.fired.fetch_add(1, Ordering::SeqCst);
        match conn.send(b"T").await {
            Ok(()) => Directive::Close,
            Err(err) => Directive::Error(err),
        }
    }
}

#[tokio::test]
async fn continue_for_overrides_the_read_timeout() {
    let fired = Arc::new(AtomicUsize::new(0));

    let server = {
        let fired = fired.clone();
        start_server(move || Box::new(Impatient { fired: fired.clone() }) as Box<dyn Handler>)
            .await
    };
    let addr = server.listener_info().local_addr;

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();

    // Send nothing: the 50ms override, not the 60s default, must fire.
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"T", &buf);
    assert!(started.elapsed() < Duration::from_secs(5));

    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    server.stop().await;
}
