//! Stream-ingress mode: the peer hands us an already-reliable bytestream,
//! so the TCP layer is bypassed and the TLS session consumes directly.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{error, info};

use crate::err::Error;
use crate::keys::Identity;
use crate::pause::Pause;
use crate::tls::Session;

pub fn serve(port: u16, identity: Arc<Identity>, pause: Arc<Pause>) -> Result<(), Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!("stream: listening on :{}", port);

    loop {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("stream: accept: {}", e);
                continue;
            }
        };
        info!("stream: connection from {}", peer);

        let identity = identity.clone();
        let pause = pause.clone();
        thread::spawn(move || {
            if let Err(e) = serve_peer(socket, identity, pause) {
                error!("stream: {}: {}", peer, e);
            }
            info!("stream: {} done", peer);
        });
    }
}

fn serve_peer(
    mut socket: TcpStream,
    identity: Arc<Identity>,
    pause: Arc<Pause>,
) -> std::io::Result<()> {
    let mut session = Session::new(identity);
    let mut buf = [0u8; 4096];

    loop {
        let n = socket.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }

        let flow = session.ingest(&buf[..n], &pause);
        if !flow.wire.is_empty() {
            socket.write_all(&flow.wire)?;
        }

        if let Some(fatal) = flow.fatal {
            error!("stream: {}", fatal);
            return Ok(());
        }
        if flow.close {
            let _ = socket.shutdown(Shutdown::Write);
            return Ok(());
        }
    }
}
