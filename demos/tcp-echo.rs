//! A TCP server that echoes everything it receives.
//!
//! Run with:
//!
//! ```
//! cargo run --example tcp-echo
//! ```
//!
//! Then talk to it with `nc 127.0.0.1 7000`.

use sockloop::{SocketServer, SocketType};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let server = SocketServer::new()?;

    let listener = server.create_async_socket(SocketType::Stream)?;
    listener.bind("127.0.0.1:7000".parse().unwrap())?;
    listener.listen(16)?;
    println!("Listening on {}", listener.local_addr()?);

    listener.on_readable(|l| {
        let (sock, addr) = match l.accept() {
            Ok(pair) => pair,
            Err(err) => {
                eprintln!("accept failed: {}", err);
                return;
            }
        };
        println!("Accepted client: {}", addr);

        sock.on_readable(|s| {
            let mut buf = [0u8; 4096];
            loop {
                match s.recv(&mut buf) {
                    Ok(n) => {
                        let _ = s.send(&buf[..n]);
                    }
                    // Drained for now; the next event re-arms us.
                    Err(_) => break,
                }
            }
        });

        sock.on_closed(move |s, _err| {
            println!("Client gone: {}", addr);
            let _ = s.close();
        });
    });

    loop {
        server.wait(None, true)?;
    }
}
