//! End-to-end socket lifecycle scenarios against std::net peers.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wirepost::{
    AddressFamily, Callback, EventKind, EventLoop, HandlerId, Socket, SocketEvent,
    SocketEventHandler, SocketState,
};

type EventLog = Arc<Mutex<Vec<(EventKind, i32, Option<String>)>>>;

fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Polls the event loop until `done` holds or `timeout` elapses.
fn drive(event_loop: &mut EventLoop, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        event_loop.poll(Some(deadline - now));
    }
    true
}

/// The worker publishes its final state moments after emitting the
/// terminal event; give it a beat.
fn wait_for_state(socket: &Socket, state: SocketState) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while socket.state() != state && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(socket.state(), state);
}

/// Records every event; the socket stays with the test body.
struct Recorder {
    log: EventLog,
}

impl SocketEventHandler for Recorder {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        self.log.lock().unwrap().push((
            event.kind(),
            event.error(),
            event.data().map(String::from),
        ));
    }
}

struct CountingCallback(AtomicUsize);

impl Callback for CountingCallback {
    fn cb(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drives one echo round-trip: writes PING on the first write event,
/// drains on read events.
struct EchoClient {
    socket: Socket,
    log: EventLog,
    received: Arc<Mutex<Vec<u8>>>,
    wrote: bool,
}

impl SocketEventHandler for EchoClient {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        self.log.lock().unwrap().push((
            event.kind(),
            event.error(),
            event.data().map(String::from),
        ));
        match event.kind() {
            EventKind::Write if event.error() == 0 && !self.wrote => {
                if self.socket.state() == SocketState::Connected {
                    let n = self.socket.write(b"PING").unwrap();
                    assert!(n > 0 && n <= 4);
                    self.wrote = true;
                }
            }
            EventKind::Read if event.error() == 0 => {
                let mut peeked = [0u8; 16];
                let _ = self.socket.peek(&mut peeked);
                loop {
                    let mut buf = [0u8; 16];
                    match self.socket.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => self.received.lock().unwrap().extend_from_slice(&buf[..n]),
                        Err(err) => {
                            assert!(err.would_block(), "read failed: {}", err);
                            break;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[test]
fn loopback_echo_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"PING");
        stream.write_all(b"PONG").unwrap();
        // hold the connection until the client goes away
        let _ = stream.read(&mut [0u8; 16]);
    });

    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));

    let counter = Arc::new(CountingCallback(AtomicUsize::new(0)));
    socket.set_synchronous_read_callback(Some(counter.clone() as Arc<dyn Callback>));
    socket.set_flags(wirepost::FLAG_NODELAY);

    socket
        .connect("127.0.0.1", port as u32, AddressFamily::Ipv4)
        .unwrap();
    assert_eq!(socket.peer_host(), "127.0.0.1");

    let log = new_log();
    let received = Arc::new(Mutex::new(Vec::new()));
    event_loop.insert_handler(
        handler,
        Box::new(EchoClient {
            socket,
            log: log.clone(),
            received: received.clone(),
            wrote: false,
        }),
    );

    assert!(
        drive(&mut event_loop, Duration::from_secs(5), || {
            *received.lock().unwrap() == b"PONG"
        }),
        "echo round-trip timed out; events: {:?}",
        log.lock().unwrap()
    );

    let log = log.lock().unwrap();
    assert_eq!(
        log[0],
        (
            EventKind::HostAddress,
            0,
            Some(format!("127.0.0.1:{}", port))
        )
    );
    assert_eq!(log[1], (EventKind::Connection, 0, None));
    assert!(log.iter().any(|e| e.0 == EventKind::Write && e.1 == 0));
    assert!(counter.0.load(Ordering::SeqCst) >= 1);

    drop(event_loop);
    server.join().unwrap();
}

#[test]
fn connection_refused_reports_host_then_failure() {
    // Bind an ephemeral port, then free it again so nothing listens.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let log = new_log();
    event_loop.insert_handler(handler, Box::new(Recorder { log: log.clone() }));

    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));
    socket
        .connect("127.0.0.1", port as u32, AddressFamily::Ipv4)
        .unwrap();

    assert!(drive(&mut event_loop, Duration::from_secs(5), || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| e.0 == EventKind::Connection)
    }));

    let log = log.lock().unwrap();
    assert_eq!(
        log[0],
        (
            EventKind::HostAddress,
            0,
            Some(format!("127.0.0.1:{}", port))
        )
    );
    assert_eq!(log[1], (EventKind::Connection, libc::ECONNREFUSED, None));
    drop(log);
    wait_for_state(&socket, SocketState::Closed);
}

#[test]
fn unresolvable_name_reports_single_connection_failure() {
    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let log = new_log();
    event_loop.insert_handler(handler, Box::new(Recorder { log: log.clone() }));

    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));
    socket
        .connect("no.such.host.invalid", 80, AddressFamily::Unspec)
        .unwrap();

    assert!(drive(&mut event_loop, Duration::from_secs(10), || {
        !log.lock().unwrap().is_empty()
    }));
    // allow any stragglers (there must be none)
    drive(&mut event_loop, Duration::from_millis(100), || false);

    {
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1, "expected a single event, got {:?}", *log);
        assert_eq!(log[0].0, EventKind::Connection);
        assert_ne!(log[0].1, 0);
    }
    wait_for_state(&socket, SocketState::Closed);
}

/// Reads whatever is available on each read event; remembers how many
/// bytes had arrived when the close event was seen.
struct DrainClient {
    socket: Socket,
    log: EventLog,
    received: Arc<Mutex<Vec<u8>>>,
    closed_after: Arc<Mutex<Option<usize>>>,
}

impl SocketEventHandler for DrainClient {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        self.log.lock().unwrap().push((
            event.kind(),
            event.error(),
            event.data().map(String::from),
        ));
        match event.kind() {
            EventKind::Read if event.error() == 0 => loop {
                let mut buf = [0u8; 2];
                match self.socket.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.received.lock().unwrap().extend_from_slice(&buf[..n]),
                    Err(err) => {
                        assert!(err.would_block(), "read failed: {}", err);
                        break;
                    }
                }
            },
            EventKind::Close => {
                *self.closed_after.lock().unwrap() = Some(self.received.lock().unwrap().len());
            }
            _ => {}
        }
    }
}

#[test]
fn remote_close_delivered_only_after_data_is_drained() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"ABCDE").unwrap();
        // FIN races the data on purpose
    });

    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));
    socket
        .connect("127.0.0.1", port as u32, AddressFamily::Ipv4)
        .unwrap();

    let log = new_log();
    let received = Arc::new(Mutex::new(Vec::new()));
    let closed_after = Arc::new(Mutex::new(None));
    event_loop.insert_handler(
        handler,
        Box::new(DrainClient {
            socket,
            log: log.clone(),
            received: received.clone(),
            closed_after: closed_after.clone(),
        }),
    );

    assert!(
        drive(&mut event_loop, Duration::from_secs(5), || {
            closed_after.lock().unwrap().is_some()
        }),
        "no close event; events: {:?}",
        log.lock().unwrap()
    );

    assert_eq!(*received.lock().unwrap(), b"ABCDE");
    assert_eq!(*closed_after.lock().unwrap(), Some(5));
    let log = log.lock().unwrap();
    assert_eq!(log.last().unwrap().0, EventKind::Close);
    assert_eq!(log.last().unwrap().1, 0);

    server.join().unwrap();
}

#[test]
fn close_during_connect_suppresses_further_events() {
    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let log = new_log();
    event_loop.insert_handler(handler, Box::new(Recorder { log: log.clone() }));

    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));
    // Non-routable test address: the attempt stays in progress.
    socket
        .connect("10.255.255.1", 80, AddressFamily::Ipv4)
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    socket.close();
    assert_eq!(socket.state(), SocketState::None);

    drive(&mut event_loop, Duration::from_millis(300), || false);
    let log = log.lock().unwrap();
    assert!(
        !log.iter()
            .any(|e| e.0 == EventKind::Connection || e.0 == EventKind::Close),
        "events delivered after close: {:?}",
        *log
    );
}

struct ListenerHandler {
    socket: Socket,
    log: EventLog,
    accepted: Arc<Mutex<Option<Socket>>>,
}

impl SocketEventHandler for ListenerHandler {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        self.log.lock().unwrap().push((
            event.kind(),
            event.error(),
            event.data().map(String::from),
        ));
        if event.kind() == EventKind::Connection && event.error() == 0 {
            if let Ok(peer) = self.socket.accept() {
                *self.accepted.lock().unwrap() = Some(peer);
            }
        }
    }
}

struct ReaderHandler {
    socket: Socket,
    received: Arc<Mutex<Vec<u8>>>,
}

impl SocketEventHandler for ReaderHandler {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        if event.kind() == EventKind::Read && event.error() == 0 {
            loop {
                let mut buf = [0u8; 16];
                match self.socket.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.received.lock().unwrap().extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        }
    }
}

#[test]
fn listen_accept_spawns_connected_socket() {
    let mut event_loop = EventLoop::new();
    let listener_id = HandlerId::new();
    let mut listener = Socket::new(event_loop.dispatcher(), Some(listener_id));

    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    assert_eq!(listener.state(), SocketState::Listening);
    let port = listener.local_port().unwrap();
    assert!(port >= 1);

    let log = new_log();
    let accepted = Arc::new(Mutex::new(None));
    event_loop.insert_handler(
        listener_id,
        Box::new(ListenerHandler {
            socket: listener,
            log: log.clone(),
            accepted: accepted.clone(),
        }),
    );

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"hello").unwrap();
        // hold the connection until the peer goes away
        let _ = stream.read(&mut [0u8; 16]);
    });

    assert!(drive(&mut event_loop, Duration::from_secs(5), || {
        accepted.lock().unwrap().is_some()
    }));
    assert_eq!(log.lock().unwrap()[0], (EventKind::Connection, 0, None));

    let mut peer = accepted.lock().unwrap().take().unwrap();
    assert_eq!(peer.state(), SocketState::Connected);
    assert_eq!(peer.address_family(), AddressFamily::Ipv4);
    assert!(peer.local_port().unwrap() >= 1);
    assert!(peer.remote_port().unwrap() >= 1);
    assert_eq!(peer.peer_ip(false).unwrap(), "127.0.0.1");

    // Installing a handler on an already-connected socket synthesizes
    // write and read events, so the new consumer starts reading.
    let peer_id = HandlerId::new();
    peer.set_event_handler(Some(peer_id));
    let received = Arc::new(Mutex::new(Vec::new()));
    event_loop.insert_handler(
        peer_id,
        Box::new(ReaderHandler {
            socket: peer,
            received: received.clone(),
        }),
    );

    assert!(drive(&mut event_loop, Duration::from_secs(5), || {
        *received.lock().unwrap() == b"hello"
    }));

    drop(event_loop);
    client.join().unwrap();
}

/// Writes until the kernel pushes back, then waits for the write event
/// that follows the peer draining.
struct SaturatingWriter {
    socket: Socket,
    write_events: Arc<AtomicUsize>,
    total_sent: Arc<AtomicUsize>,
    drain_tx: Option<mpsc::Sender<usize>>,
}

impl SocketEventHandler for SaturatingWriter {
    fn on_socket_event(&mut self, event: &SocketEvent) {
        if event.kind() != EventKind::Write || event.error() != 0 {
            return;
        }
        self.write_events.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.drain_tx.take() {
            let chunk = vec![0u8; 64 * 1024];
            let mut total = 0usize;
            loop {
                match self.socket.write(&chunk) {
                    Ok(n) => {
                        assert!(n > 0 && n <= chunk.len());
                        total += n;
                    }
                    Err(err) => {
                        assert!(err.would_block(), "write failed: {}", err);
                        break;
                    }
                }
            }
            self.total_sent.store(total, Ordering::SeqCst);
            tx.send(total).unwrap();
        }
    }
}

#[test]
fn saturated_write_gets_a_write_event_after_drain() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (drain_tx, drain_rx) = mpsc::channel::<usize>();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // don't read until the writer has hit EAGAIN
        let expected = drain_rx.recv().unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut seen = 0usize;
        while seen < expected {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => seen += n,
                Err(_) => break,
            }
        }
        seen
    });

    let mut event_loop = EventLoop::new();
    let handler = HandlerId::new();
    let mut socket = Socket::new(event_loop.dispatcher(), Some(handler));
    socket.set_buffer_sizes(Some(4096), Some(4096));
    socket
        .connect("127.0.0.1", port as u32, AddressFamily::Ipv4)
        .unwrap();

    let write_events = Arc::new(AtomicUsize::new(0));
    let total_sent = Arc::new(AtomicUsize::new(0));
    event_loop.insert_handler(
        handler,
        Box::new(SaturatingWriter {
            socket,
            write_events: write_events.clone(),
            total_sent: total_sent.clone(),
            drain_tx: Some(drain_tx),
        }),
    );

    assert!(
        drive(&mut event_loop, Duration::from_secs(10), || {
            write_events.load(Ordering::SeqCst) >= 2
        }),
        "no write event followed the drain"
    );
    assert!(total_sent.load(Ordering::SeqCst) > 0);

    drop(event_loop);
    assert_eq!(server.join().unwrap(), total_sent.load(Ordering::SeqCst));
}

#[test]
fn cleanup_joins_detached_workers() {
    let event_loop = EventLoop::new();
    let mut socket = Socket::new(event_loop.dispatcher(), None);
    socket
        .connect("10.255.255.1", 80, AddressFamily::Ipv4)
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    drop(socket);
    Socket::cleanup(true);
}
