use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sockloop::{ConnState, Dispatcher, Endpoint, Events, SocketServer, SocketType};

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Drives the server until `done` holds, panicking after five seconds.
fn drive(server: &SocketServer, mut done: impl FnMut() -> bool) -> io::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for events");
        server.wait(Some(Duration::from_millis(50)), true)?;
    }
    Ok(())
}

#[test]
fn loopback_echo() -> io::Result<()> {
    let server = SocketServer::new()?;

    let listener = server.create_async_socket(SocketType::Stream)?;
    listener.bind(localhost())?;
    listener.listen(5)?;
    let addr = listener.local_addr()?;

    let server_events = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let events = server_events.clone();
        listener.on_readable(move |l| {
            let (sock, _) = l.accept().unwrap();
            events.lock().unwrap().push("accept".to_string());

            let read_events = events.clone();
            sock.on_readable(move |s| {
                let mut buf = [0u8; 16];
                let n = s.recv(&mut buf).unwrap();
                read_events.lock().unwrap().push(format!("read:{}", n));
                assert_eq!(s.send(&buf[..n]).unwrap(), n);
            });

            let close_events = events.clone();
            sock.on_closed(move |s, err| {
                close_events.lock().unwrap().push(format!("close:{}", err));
                s.close().unwrap();
            });
        });
    }

    let client = server.create_async_socket(SocketType::Stream)?;
    let client_events = Arc::new(Mutex::new(Vec::<String>::new()));
    let echoed = Arc::new(Mutex::new(Vec::<u8>::new()));
    {
        let events = client_events.clone();
        client.on_connected(move |c| {
            events.lock().unwrap().push("connect".to_string());
            assert_eq!(c.send(b"hello").unwrap(), 5);
        });

        let events = client_events.clone();
        let echoed = echoed.clone();
        client.on_readable(move |c| {
            let mut buf = [0u8; 16];
            let n = c.recv(&mut buf).unwrap();
            echoed.lock().unwrap().extend_from_slice(&buf[..n]);
            events.lock().unwrap().push(format!("read:{}", n));
            if echoed.lock().unwrap().len() >= 5 {
                c.close().unwrap();
            }
        });
    }
    client.connect(addr)?;

    drive(&server, || {
        server_events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("close"))
    })?;

    assert_eq!(&*echoed.lock().unwrap(), b"hello");

    let server_events = server_events.lock().unwrap();
    assert_eq!(server_events[0], "accept");
    assert!(server_events.contains(&"read:5".to_string()));
    assert_eq!(server_events.last().unwrap(), "close:0");

    let client_events = client_events.lock().unwrap();
    assert_eq!(client_events[0], "connect");
    assert!(client_events.contains(&"read:5".to_string()));

    listener.close()?;
    Ok(())
}

#[test]
fn async_connect_to_closed_port() -> io::Result<()> {
    let server = SocketServer::new()?;

    // Grab a port with nothing listening behind it.
    let port = std::net::TcpListener::bind("127.0.0.1:0")?
        .local_addr()?
        .port();
    let target = SocketAddr::from(([127, 0, 0, 1], port));

    let client = server.create_async_socket(SocketType::Stream)?;
    let connected = Arc::new(AtomicBool::new(false));
    let close_err = Arc::new(Mutex::new(None::<i32>));
    {
        let connected = connected.clone();
        client.on_connected(move |_| {
            connected.store(true, Ordering::SeqCst);
        });
        let close_err = close_err.clone();
        client.on_closed(move |_, err| {
            *close_err.lock().unwrap() = Some(err);
        });
    }

    client.connect(target)?;
    assert_eq!(client.state(), ConnState::Connecting);

    drive(&server, || close_err.lock().unwrap().is_some())?;

    assert!(!connected.load(Ordering::SeqCst));
    let err = close_err.lock().unwrap().unwrap();
    assert_eq!(
        io::Error::from_raw_os_error(err).kind(),
        io::ErrorKind::ConnectionRefused
    );
    assert_eq!(client.state(), ConnState::Closed);
    client.close()?;
    Ok(())
}

#[test]
fn resolver_backed_connect() -> io::Result<()> {
    let server = SocketServer::new()?;

    let listener = server.create_async_socket(SocketType::Stream)?;
    listener.bind(localhost())?;
    listener.listen(5)?;
    let port = listener.local_addr()?.port();

    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    {
        let received = received.clone();
        listener.on_readable(move |l| {
            let (sock, _) = l.accept().unwrap();
            let received = received.clone();
            sock.on_readable(move |s| {
                let mut buf = [0u8; 16];
                if let Ok(n) = s.recv(&mut buf) {
                    received.lock().unwrap().extend_from_slice(&buf[..n]);
                }
            });
        });
    }

    let client = server.create_async_socket(SocketType::Stream)?;
    client.on_connected(|c| {
        assert_eq!(c.send(b"x").unwrap(), 1);
    });
    client.connect(Endpoint::host("localhost", port))?;
    assert_eq!(client.state(), ConnState::Connecting);

    drive(&server, || received.lock().unwrap().as_slice() == b"x")?;

    assert_eq!(client.state(), ConnState::Connected);
    client.close()?;
    listener.close()?;
    Ok(())
}

#[test]
fn wakeup_from_another_thread() -> io::Result<()> {
    let server = SocketServer::new()?;

    let waker = server.clone();
    let start = Instant::now();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake_up();
    });

    server.wait(None, true)?;
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(30), "woke too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "woke too late: {:?}", elapsed);
    handle.join().unwrap();
    Ok(())
}

#[test]
fn wakeups_coalesce() -> io::Result<()> {
    let server = SocketServer::new()?;

    for _ in 0..8 {
        server.wake_up();
    }

    // One pass consumes the single buffered wakeup...
    let start = Instant::now();
    server.wait(Some(Duration::from_secs(1)), true)?;
    assert!(start.elapsed() < Duration::from_millis(500));

    // ...and with the pipe drained the next wait runs to its timeout.
    let start = Instant::now();
    server.wait(Some(Duration::from_millis(100)), true)?;
    assert!(start.elapsed() >= Duration::from_millis(80));
    Ok(())
}

#[test]
fn udp_send_to_recv_from() -> io::Result<()> {
    let server = SocketServer::new()?;

    let a = server.create_async_socket(SocketType::Datagram)?;
    a.bind(localhost())?;
    let b = server.create_async_socket(SocketType::Datagram)?;
    b.bind(localhost())?;
    let a_addr = a.local_addr()?;
    let b_addr = b.local_addr()?;

    let reads = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(None::<(Vec<u8>, SocketAddr)>));
    {
        let reads = reads.clone();
        let received = received.clone();
        b.on_readable(move |s| {
            reads.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 16];
            let (n, from) = s.recv_from(&mut buf).unwrap();
            *received.lock().unwrap() = Some((buf[..n].to_vec(), from));
        });
    }

    assert_eq!(a.send_to(&[1, 2, 3], b_addr)?, 3);
    drive(&server, || received.lock().unwrap().is_some())?;

    // One extra pass: no duplicate read for a drained socket.
    server.wait(Some(Duration::from_millis(50)), true)?;

    let (data, from) = received.lock().unwrap().take().unwrap();
    assert_eq!(data, vec![1, 2, 3]);
    assert_eq!(from, a_addr);
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    a.close()?;
    b.close()?;
    Ok(())
}

// A FIN behind pending data: the data is delivered through a read event
// first, the close event follows on a later pass, exactly once.
#[test]
fn graceful_half_close_defers_close() -> io::Result<()> {
    let server = SocketServer::new()?;

    let listener = server.create_async_socket(SocketType::Stream)?;
    listener.bind(localhost())?;
    listener.listen(5)?;
    let addr = listener.local_addr()?;

    listener.on_readable(|l| {
        let (sock, _) = l.accept().unwrap();
        // Leave a parting message and close; the client must see the
        // data before the close.
        assert_eq!(sock.send(b"bye").unwrap(), 3);
        sock.close().unwrap();
    });

    let client = server.create_async_socket(SocketType::Stream)?;
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let events_r = events.clone();
        client.on_readable(move |c| {
            let mut buf = [0u8; 16];
            loop {
                match c.recv(&mut buf) {
                    Ok(n) => events_r.lock().unwrap().push(format!("read:{}", n)),
                    Err(err) => {
                        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
                        break;
                    }
                }
            }
        });
        let events_c = events.clone();
        client.on_closed(move |c, err| {
            events_c.lock().unwrap().push(format!("close:{}", err));
            c.close().unwrap();
        });
    }
    client.connect(addr)?;

    drive(&server, || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("close"))
    })?;
    // One extra pass: the close must not repeat.
    server.wait(Some(Duration::from_millis(50)), true)?;

    let events = events.lock().unwrap();
    let read_at = events.iter().position(|e| e == "read:3");
    let close_at = events.iter().position(|e| e == "close:0");
    assert!(read_at.is_some(), "no read before close: {:?}", *events);
    assert!(close_at.is_some(), "no close delivered: {:?}", *events);
    assert!(read_at < close_at, "close overtook the data: {:?}", *events);
    assert_eq!(
        events.iter().filter(|e| e.starts_with("close")).count(),
        1,
        "close delivered more than once: {:?}",
        *events
    );

    listener.close()?;
    Ok(())
}

#[test]
fn close_is_idempotent_and_poisons_operations() -> io::Result<()> {
    let server = SocketServer::new()?;

    let sock = server.create_async_socket(SocketType::Stream)?;
    sock.bind(localhost())?;
    sock.close()?;

    let mut buf = [0u8; 4];
    assert!(sock.send(b"x").is_err());
    assert!(sock.recv(&mut buf).is_err());
    assert!(sock.bind(localhost()).is_err());
    assert!(sock.listen(1).is_err());
    assert_ne!(sock.last_error(), 0);
    assert_eq!(sock.state(), ConnState::Closed);

    // A second close is a quiet no-op.
    sock.close()?;
    Ok(())
}

/// A dispatcher that never becomes ready; registry bookkeeping only.
struct IdleDispatcher;

impl Dispatcher for IdleDispatcher {
    fn requested_events(&self) -> Events {
        Events::empty()
    }

    #[cfg(unix)]
    fn descriptor(&self) -> std::os::unix::io::RawFd {
        -1
    }

    #[cfg(unix)]
    fn is_descriptor_closed(&self) -> bool {
        false
    }

    fn on_pre_event(&self, _events: Events) {}

    fn on_event(&self, _events: Events, _err: i32) {}

    #[cfg(windows)]
    fn wsa_event(&self) -> isize {
        0
    }

    #[cfg(windows)]
    fn os_socket(&self) -> std::os::windows::io::RawSocket {
        !0
    }
}

#[test]
fn registry_rejects_duplicates_and_unknown_removals() -> io::Result<()> {
    let server = SocketServer::new()?;
    let base = server.dispatcher_count();

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(IdleDispatcher);
    server.add_dispatcher(dispatcher.clone());
    assert_eq!(server.dispatcher_count(), base + 1);

    // Duplicates are ignored.
    server.add_dispatcher(dispatcher.clone());
    assert_eq!(server.dispatcher_count(), base + 1);

    // Removing something never registered is a no-op.
    let stranger: Arc<dyn Dispatcher> = Arc::new(IdleDispatcher);
    assert!(!server.remove_dispatcher(&stranger));
    assert_eq!(server.dispatcher_count(), base + 1);

    assert!(server.remove_dispatcher(&dispatcher));
    assert_eq!(server.dispatcher_count(), base);
    Ok(())
}

// A handler that removes a later dispatcher mid-pass must not make the
// loop skip the one after it.
#[test]
fn removal_during_dispatch_keeps_iteration_consistent() -> io::Result<()> {
    let server = SocketServer::new()?;

    let a = server.create_async_socket(SocketType::Datagram)?;
    let b = server.create_async_socket(SocketType::Datagram)?;
    let c = server.create_async_socket(SocketType::Datagram)?;
    for sock in [&a, &b, &c].iter() {
        sock.bind(localhost())?;
    }

    let a_reads = Arc::new(AtomicUsize::new(0));
    let b_reads = Arc::new(AtomicUsize::new(0));
    let c_reads = Arc::new(AtomicUsize::new(0));
    {
        let a_reads = a_reads.clone();
        let doomed = b.clone();
        a.on_readable(move |s| {
            a_reads.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4];
            let _ = s.recv_from(&mut buf);
            // Remove b from the registry while the pass is running.
            doomed.close().unwrap();
        });
        let b_reads = b_reads.clone();
        b.on_readable(move |_| {
            b_reads.fetch_add(1, Ordering::SeqCst);
        });
        let c_reads = c_reads.clone();
        c.on_readable(move |s| {
            c_reads.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4];
            let _ = s.recv_from(&mut buf);
        });
    }

    let sender = server.create_async_socket(SocketType::Datagram)?;
    sender.bind(localhost())?;
    for target in [&a, &b, &c].iter() {
        sender.send_to(&[9], target.local_addr()?)?;
    }

    drive(&server, || {
        a_reads.load(Ordering::SeqCst) > 0 && c_reads.load(Ordering::SeqCst) > 0
    })?;

    // b was removed before its event could be delivered; c still got its.
    assert_eq!(b_reads.load(Ordering::SeqCst), 0);
    assert_eq!(c_reads.load(Ordering::SeqCst), 1);

    a.close()?;
    c.close()?;
    sender.close()?;
    Ok(())
}

#[test]
fn process_io_false_only_services_the_wakeup() -> io::Result<()> {
    let server = SocketServer::new()?;

    let a = server.create_async_socket(SocketType::Datagram)?;
    a.bind(localhost())?;
    let b = server.create_async_socket(SocketType::Datagram)?;
    b.bind(localhost())?;

    let reads = Arc::new(AtomicUsize::new(0));
    {
        let reads = reads.clone();
        b.on_readable(move |s| {
            reads.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4];
            let _ = s.recv_from(&mut buf);
        });
    }

    a.send_to(&[7], b.local_addr()?)?;

    // Readiness on b is ignored while process_io is off.
    server.wait(Some(Duration::from_millis(100)), false)?;
    assert_eq!(reads.load(Ordering::SeqCst), 0);

    drive(&server, || reads.load(Ordering::SeqCst) > 0)?;
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    a.close()?;
    b.close()?;
    Ok(())
}

#[test]
fn socket_options_roundtrip() -> io::Result<()> {
    let server = SocketServer::new()?;
    let sock = server.create_async_socket(SocketType::Stream)?;

    sock.set_option(sockloop::SocketOption::NoDelay, 1)?;
    assert_eq!(sock.get_option(sockloop::SocketOption::NoDelay)?, 1);

    sock.set_option(sockloop::SocketOption::SendBuf, 65536)?;
    assert!(sock.get_option(sockloop::SocketOption::SendBuf)? >= 65536);
    sock.set_option(sockloop::SocketOption::RecvBuf, 65536)?;
    assert!(sock.get_option(sockloop::SocketOption::RecvBuf)? >= 65536);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        sock.set_option(sockloop::SocketOption::DontFragment, 1)?;
        assert_eq!(sock.get_option(sockloop::SocketOption::DontFragment)?, 1);
        sock.set_option(sockloop::SocketOption::DontFragment, 0)?;
        assert_eq!(sock.get_option(sockloop::SocketOption::DontFragment)?, 0);
    }

    sock.close()?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn estimate_mtu_requires_a_connection() -> io::Result<()> {
    let server = SocketServer::new()?;

    let unconnected = server.create_async_socket(SocketType::Stream)?;
    assert!(unconnected.estimate_mtu().is_err());
    unconnected.close()?;

    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let client = server.create_async_socket(SocketType::Stream)?;
    let connected = Arc::new(AtomicBool::new(false));
    {
        let connected = connected.clone();
        client.on_connected(move |_| {
            connected.store(true, Ordering::SeqCst);
        });
    }
    client.connect(addr)?;
    let (_peer, _) = listener.accept()?;
    drive(&server, || connected.load(Ordering::SeqCst))?;

    let mtu = client.estimate_mtu()?;
    assert!(mtu >= 576, "implausible loopback mtu {}", mtu);

    client.close()?;
    Ok(())
}

#[test]
fn plain_socket_connects_and_transfers_inline() -> io::Result<()> {
    use std::io::{Read, Write};

    let server = SocketServer::new()?;
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let sock = server.create_socket(SocketType::Stream)?;
    sock.connect(addr)?;
    assert_eq!(sock.state(), ConnState::Connected);
    let (mut peer, _) = listener.accept()?;

    assert_eq!(sock.send(b"ping")?, 4);
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf)?;
    assert_eq!(&buf, b"ping");

    peer.write_all(b"pong")?;
    let n = sock.recv(&mut buf)?;
    assert_eq!(&buf[..n], b"pong");
    sock.close()?;

    // Host endpoints resolve inline on the synchronous socket.
    let sock = server.create_socket(SocketType::Stream)?;
    sock.connect(Endpoint::host("localhost", addr.port()))?;
    assert_eq!(sock.state(), ConnState::Connected);
    let _ = listener.accept()?;
    sock.close()?;
    Ok(())
}
