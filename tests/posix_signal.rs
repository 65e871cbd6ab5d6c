#![cfg(unix)]

// The signal bridge is process-global (one trampoline, one flag array),
// so everything is exercised from a single test body; parallel test
// threads would race on the shared state.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use sockloop::{SignalAction, SocketServer};

const SIGNUM: i32 = Signal::SIGUSR1 as i32;

fn raise_usr1() {
    kill(Pid::this(), Signal::SIGUSR1).unwrap();
}

fn wait_for(server: &SocketServer, count: &AtomicUsize) -> io::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "signal never delivered");
        server.wait(Some(Duration::from_millis(100)), true)?;
    }
    Ok(())
}

#[test]
fn signals_reach_the_loop() -> io::Result<()> {
    let server = SocketServer::new()?;

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        server.set_posix_signal_handler(
            SIGNUM,
            SignalAction::handle(move |signum| {
                assert_eq!(signum, SIGNUM);
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )?;
    }

    // A signal raised while the loop is idle is picked up within one
    // pass, exactly once.
    raise_usr1();
    wait_for(&server, &count)?;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    server.wait(Some(Duration::from_millis(100)), true)?;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Back-to-back deliveries between passes may coalesce, but never to
    // zero and never beyond the number raised.
    count.store(0, Ordering::SeqCst);
    raise_usr1();
    raise_usr1();
    raise_usr1();
    wait_for(&server, &count)?;
    let seen = count.load(Ordering::SeqCst);
    assert!((1..=3).contains(&seen), "unexpected deliveries: {}", seen);

    // After clearing the registration the signal is ignored again.
    server.set_posix_signal_handler(SIGNUM, SignalAction::Ignore)?;
    count.store(0, Ordering::SeqCst);
    raise_usr1();
    server.wait(Some(Duration::from_millis(100)), true)?;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    Ok(())
}
