//! End-to-end scenarios over real sockets: echo under concurrency,
//! cross-thread sends, idle timeouts, back-pressure ordering, UDP, and
//! shutdown accounting.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive::{serve, Action, Config, Conn, Events, Opts, RingBuffer, ServerInfo};

/// Counting echo server; a leading `@` byte from any peer shuts it down.
struct EchoServer {
    state: Arc<EchoState>,
}

struct EchoState {
    addr_tx: Mutex<Option<mpsc::Sender<SocketAddr>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    close_causes: Mutex<Vec<Option<io::ErrorKind>>>,
}

impl EchoState {
    fn new(addr_tx: mpsc::Sender<SocketAddr>) -> Arc<EchoState> {
        Arc::new(EchoState {
            addr_tx: Mutex::new(Some(addr_tx)),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            close_causes: Mutex::new(Vec::new()),
        })
    }
}

impl Events for EchoServer {
    type Context = ();

    fn serving(&self, srv: &ServerInfo) -> Action {
        if let Some(tx) = self.state.addr_tx.lock().unwrap().take() {
            if let Some(sockaddr) = srv.addrs[0].inet() {
                let _ = tx.send(sockaddr);
            }
        }
        Action::None
    }

    fn opened(&self, _conn: &Conn<()>) -> (Vec<u8>, Opts, Action) {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        (Vec::new(), Opts::default(), Action::None)
    }

    fn data(&self, _conn: &Conn<()>, input: &mut RingBuffer) -> (Vec<u8>, Action) {
        let (head, tail) = input.peek_all();
        if head.first() == Some(&b'@') {
            return (Vec::new(), Action::Shutdown);
        }

        let mut out = head.to_vec();
        out.extend_from_slice(tail);
        input.retrieve_all();
        (out, Action::None)
    }

    fn closed(&self, _conn: &Conn<()>, err: Option<&io::Error>) -> Action {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.state
            .close_causes
            .lock()
            .unwrap()
            .push(err.map(|e| e.kind()));
        Action::None
    }
}

fn start_echo(config: Config) -> (Arc<EchoState>, SocketAddr, thread::JoinHandle<io::Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let state = EchoState::new(tx);
    let events = EchoServer {
        state: state.clone(),
    };
    let handle = thread::spawn(move || serve(events, config, &["tcp://127.0.0.1:0"]));
    let addr = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server did not start");
    (state, addr, handle)
}

fn shutdown(addr: SocketAddr) {
    let mut control = TcpStream::connect(addr).expect("connect control");
    control
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    control.write_all(b"@").expect("send shutdown");
    // hold the socket until the server drops it
    let _ = control.read(&mut [0u8; 1]);
}

#[test]
fn echo_many_clients_two_loops() {
    let config = Config {
        num_loops: 2,
        ..Config::default()
    };
    let (state, addr, handle) = start_echo(config);

    let workers: Vec<_> = (0..10)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..10 {
                    let mut sock = TcpStream::connect(addr).expect("connect");
                    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

                    let payload = [b'x'; 1024];
                    sock.write_all(&payload).expect("write");

                    let mut got = [0u8; 1024];
                    sock.read_exact(&mut got).expect("read echo");
                    assert_eq!(got[..], payload[..]);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    shutdown(addr);
    handle.join().unwrap().unwrap();

    // 100 clients plus the control connection, each opened exactly once and
    // closed exactly once
    assert_eq!(state.opened.load(Ordering::SeqCst), 101);
    assert_eq!(state.closed.load(Ordering::SeqCst), 101);
}

#[test]
fn idle_connections_time_out() {
    let config = Config {
        wait_timeout: Some(Duration::from_secs(1)),
        ..Config::default()
    };
    let (state, addr, handle) = start_echo(config);

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let begin = Instant::now();
    let n = sock.read(&mut [0u8; 16]).expect("read");
    assert_eq!(n, 0, "expected EOF from idle close");
    assert!(begin.elapsed() < Duration::from_secs(5));

    shutdown(addr);
    handle.join().unwrap().unwrap();

    let causes = state.close_causes.lock().unwrap();
    assert!(
        causes.contains(&Some(io::ErrorKind::TimedOut)),
        "missing timeout cause: {:?}",
        *causes
    );
}

#[test]
fn shutdown_delivers_closed_for_every_opened() {
    let (state, addr, handle) = start_echo(Config::default());

    let holders: Vec<_> = (0..50)
        .map(|_| {
            thread::spawn(move || {
                let mut sock = TcpStream::connect(addr).expect("connect");
                sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                // park until the server closes us during shutdown
                let n = sock.read(&mut [0u8; 1]).expect("read");
                assert_eq!(n, 0);
            })
        })
        .collect();

    // wait for every connection to land
    let begin = Instant::now();
    while state.opened.load(Ordering::SeqCst) < 50 {
        assert!(begin.elapsed() < Duration::from_secs(5), "conns never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    shutdown(addr);
    handle.join().unwrap().unwrap();

    for holder in holders {
        holder.join().unwrap();
    }

    assert_eq!(state.opened.load(Ordering::SeqCst), 51);
    assert_eq!(state.closed.load(Ordering::SeqCst), 51);
}

#[test]
fn large_transfer_stays_ordered_under_backpressure() {
    // tiny high-water mark so the transfer actually toggles read interest
    let config = Config {
        high_water_mark: 64 * 1024,
        ..Config::default()
    };
    let (_state, addr, handle) = start_echo(config);

    const TOTAL: usize = 2 * 1024 * 1024;

    // never yields '@', which the echo server reserves for shutdown
    fn pattern(pos: usize) -> u8 {
        let byte = (pos % 251) as u8;
        if byte == b'@' {
            b'#'
        } else {
            byte
        }
    }

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut writer = sock.try_clone().expect("clone");

    let feeder = thread::spawn(move || {
        let mut sent = 0usize;
        let mut chunk = [0u8; 8192];
        while sent < TOTAL {
            let n = chunk.len().min(TOTAL - sent);
            for (i, byte) in chunk[..n].iter_mut().enumerate() {
                *byte = pattern(sent + i);
            }
            writer.write_all(&chunk[..n]).expect("write");
            sent += n;
        }
    });

    let mut received = 0usize;
    let mut buf = [0u8; 8192];
    while received < TOTAL {
        let n = sock.read(&mut buf).expect("read");
        assert_ne!(n, 0, "premature EOF");
        for byte in &buf[..n] {
            assert_eq!(*byte, pattern(received), "out of order at {}", received);
            received += 1;
        }
    }

    feeder.join().unwrap();
    drop(sock);

    shutdown(addr);
    handle.join().unwrap().unwrap();
}

/// Server that hands accepted connections to the test through a channel and
/// never echoes; used for the cross-thread `Conn::send` scenario.
struct HandoffServer {
    addr_tx: Mutex<Option<mpsc::Sender<SocketAddr>>>,
    conn_tx: Mutex<mpsc::Sender<Conn<()>>>,
}

impl Events for HandoffServer {
    type Context = ();

    fn serving(&self, srv: &ServerInfo) -> Action {
        if let Some(tx) = self.addr_tx.lock().unwrap().take() {
            let _ = tx.send(srv.addrs[0].inet().unwrap());
        }
        Action::None
    }

    fn opened(&self, conn: &Conn<()>) -> (Vec<u8>, Opts, Action) {
        let _ = self.conn_tx.lock().unwrap().send(conn.clone());
        (Vec::new(), Opts::default(), Action::None)
    }

    fn data(&self, _conn: &Conn<()>, input: &mut RingBuffer) -> (Vec<u8>, Action) {
        let (head, _) = input.peek_all();
        if head.first() == Some(&b'@') {
            return (Vec::new(), Action::Shutdown);
        }
        input.retrieve_all();
        (Vec::new(), Action::None)
    }
}

#[test]
fn cross_thread_sends_all_arrive() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();
    let events = HandoffServer {
        addr_tx: Mutex::new(Some(addr_tx)),
        conn_tx: Mutex::new(conn_tx),
    };
    let handle = thread::spawn(move || serve(events, Config::default(), &["tcp://127.0.0.1:0"]));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut sock = TcpStream::connect(addr).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let conn = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("conn handle");

    let senders: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    conn.send("X");
                }
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }

    let mut received = 0usize;
    let mut buf = [0u8; 4096];
    while received < 8000 {
        let n = sock.read(&mut buf).expect("read");
        assert_ne!(n, 0, "premature EOF");
        assert!(buf[..n].iter().all(|b| *b == b'X'));
        received += n;
    }
    assert_eq!(received, 8000);

    drop(sock);
    shutdown(addr);
    handle.join().unwrap().unwrap();
}

#[test]
fn unix_echo() {
    let path = std::env::temp_dir().join(format!("hive-echo-{}.sock", std::process::id()));
    let uri = format!("unix://{}", path.display());

    let (addr_tx, _addr_rx) = mpsc::channel();
    let state = EchoState::new(addr_tx);
    let events = EchoServer {
        state: state.clone(),
    };

    let handle = thread::spawn(move || serve(events, Config::default(), &[uri.as_str()]));

    // wait for the socket file to appear
    let begin = Instant::now();
    while !path.exists() {
        assert!(begin.elapsed() < Duration::from_secs(5), "listener never bound");
        thread::sleep(Duration::from_millis(10));
    }

    let mut sock = std::os::unix::net::UnixStream::connect(&path).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    sock.write_all(b"over the wire").expect("write");
    let mut got = [0u8; 13];
    sock.read_exact(&mut got).expect("read echo");
    assert_eq!(&got[..], b"over the wire");

    let mut control = std::os::unix::net::UnixStream::connect(&path).expect("connect control");
    control.write_all(b"@").expect("send shutdown");
    handle.join().unwrap().unwrap();

    assert_eq!(state.opened.load(Ordering::SeqCst), 2);
    assert_eq!(state.closed.load(Ordering::SeqCst), 2);
    assert!(!path.exists(), "socket file should be unlinked");
}

#[test]
fn udp_echo_same_four_tuple() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let state = EchoState::new(addr_tx);
    let events = EchoServer {
        state: state.clone(),
    };

    let handle = thread::spawn(move || serve(events, Config::default(), &["udp://127.0.0.1:0"]));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").expect("bind");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let payload = [b'd'; 64];
    client.send_to(&payload, addr).expect("send");

    let mut got = [0u8; 128];
    let (n, from) = client.recv_from(&mut got).expect("recv");
    assert_eq!(n, 64);
    assert_eq!(got[..64], payload[..]);
    assert_eq!(from, addr);

    client.send_to(b"@", addr).expect("send shutdown");
    handle.join().unwrap().unwrap();

    // datagrams leave no connection bookkeeping behind
    assert_eq!(state.opened.load(Ordering::SeqCst), 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 0);
}
