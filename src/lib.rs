//! A see-through userspace network stack: raw IPv4 in from a TUN device,
//! hand-built TCP, TLS 1.2 and HTTP/2 on top, one canned response out.
//! Every layer is visible, logged, and optionally single-stepped.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

pub mod config;
pub mod err;
pub mod http1;
pub mod http2;
pub mod keys;
pub mod pause;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod wire;

use config::Config;
use err::Error;
use keys::Identity;
use pause::{Layer, Pause};
use tcp::{Action, Connection, Dual, Quad};
use wire::ipv4::{self, Ipv4Header};
use wire::tcp::{flags, TcpHeader};

pub const PORT_HTTP: u16 = 80;
pub const PORT_HTTPS: u16 = 443;

/// The connection dispatcher: owns the global table and routes parsed
/// datagrams into per-connection handlers. The table mutex is only ever
/// held for lookup/insert/remove, never across I/O.
pub struct Router {
    connections: Mutex<HashMap<Quad, Arc<Mutex<Connection>>>>,
    identity: Arc<Identity>,
    pause: Arc<Pause>,
}

impl Router {
    pub fn new(identity: Arc<Identity>, pause: Arc<Pause>) -> Self {
        Router {
            connections: Mutex::new(HashMap::new()),
            identity,
            pause,
        }
    }

    /// Handles one raw IPv4 datagram from the input source; any replies
    /// are written to `link`, one datagram per write.
    pub fn ingress<W: Write>(&self, datagram: &[u8], link: &mut W) {
        self.pause.pause(Layer::Ip);

        let (iph, payload) = match Ipv4Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("ip: dropping datagram ({})", e);
                return;
            }
        };
        debug!(
            "ip: {} -> {} proto={} len={}",
            iph.src, iph.dst, iph.proto, iph.total_len
        );

        match iph.proto {
            ipv4::PROTO_TCP => self.on_tcp_segment(&iph, payload, link),
            ipv4::PROTO_ICMP => icmp_delegate(&iph),
            other => debug!("ip: discarding protocol {}", other),
        }
    }

    fn on_tcp_segment<W: Write>(&self, iph: &Ipv4Header, segment: &[u8], link: &mut W) {
        self.pause.pause(Layer::Tcp);

        let (tcph, payload) = match TcpHeader::parse(segment) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("tcp: dropping segment ({})", e);
                return;
            }
        };

        // ingress checksum validation is advisory: log, don't drop
        if !wire::tcp::verify_checksum(iph.src, iph.dst, segment) {
            warn!("tcp: checksum mismatch from {}:{}", iph.src, tcph.src_port);
        }

        let quad = Quad {
            src: Dual {
                ipv4: iph.src,
                port: tcph.src_port,
            },
            dst: Dual {
                ipv4: iph.dst,
                port: tcph.dst_port,
            },
        };

        let entry = self.connections.lock().unwrap().get(&quad).cloned();
        let conn = match entry {
            Some(conn) => conn,
            None => {
                self.on_new_quad(quad, iph, &tcph, payload, link);
                return;
            }
        };

        let action = {
            let mut conn = conn.lock().unwrap();
            match conn.on_segment(&tcph, payload, link, &self.pause) {
                Ok(action) => action,
                Err(fatal) => {
                    error!("{}: {}", quad, fatal);
                    Action::Destroy
                }
            }
        };

        if action == Action::Destroy {
            self.connections.lock().unwrap().remove(&quad);
            info!("tcp: {} removed from table", quad);
        }
    }

    fn on_new_quad<W: Write>(
        &self,
        quad: Quad,
        iph: &Ipv4Header,
        tcph: &TcpHeader,
        payload: &[u8],
        link: &mut W,
    ) {
        if !tcph.has(flags::SYN) || tcph.has(flags::ACK) {
            // no connection: everything except a fresh SYN gets a reset
            if !tcph.has(flags::RST) {
                debug!("tcp: {} has no connection, resetting", quad);
                let _ = tcp::write_reset(link, iph, tcph, payload.len());
            }
            return;
        }

        if quad.dst.port != PORT_HTTP && quad.dst.port != PORT_HTTPS {
            debug!("tcp: SYN for closed port {}, ignoring", quad.dst.port);
            return;
        }

        match Connection::open(quad, tcph, &self.identity, link) {
            Ok(conn) => {
                self.connections
                    .lock()
                    .unwrap()
                    .insert(quad, Arc::new(Mutex::new(conn)));
            }
            Err(e) => error!("tcp: {} open failed: {}", quad, e),
        }
    }
}

/// ICMP is an external collaborator; the core only logs the handoff.
fn icmp_delegate(iph: &Ipv4Header) {
    debug!("ip: icmp from {} delegated", iph.src);
}

/// Some platforms prefix TUN datagrams with a 4-byte tag: an address
/// family (big-endian 2 for IPv4) or 2 flag bytes plus an ethertype.
/// Strip either before IP parsing.
pub fn strip_af_prefix(frame: &[u8]) -> &[u8] {
    if frame.len() >= 4 && frame[0] >> 4 != 4 {
        let word = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let ethertype = u16::from_be_bytes([frame[2], frame[3]]);
        if word == 2 || ethertype == 0x0800 {
            return &frame[4..];
        }
    }
    frame
}

/// TUN-mode entry point: opens the device and runs the single ingress
/// reader for it.
pub struct NetStack {
    jh: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(cfg: &Config, identity: Arc<Identity>, pause: Arc<Pause>) -> Result<Self, Error> {
        let tun = Tun::new(&cfg.device, false)?;
        tun.set_addr(cfg.addr)?;
        tun.set_dst_addr(cfg.peer)?;
        tun.set_netmask(cfg.netmask)?;
        tun.set_mtu(cfg.mtu)?;
        tun.bring_up()?;
        info!("tun: {} up, {} -> {}", cfg.device, cfg.addr, cfg.peer);

        let router = Router::new(identity, pause);
        let jh = thread::spawn(move || datagram_loop(tun, router));

        Ok(NetStack { jh })
    }

    pub fn join(self) {
        self.jh.join().unwrap();
    }
}

/// Egress half of the TUN device: one datagram per write call.
struct TunLink<'a>(&'a mut Tun);

impl Write for TunLink<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn datagram_loop(mut tun: Tun, router: Router) {
    let mut buf = [0u8; 2048];

    loop {
        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut pfd[..], 1000) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                error!("tun: poll: {}", e);
                continue;
            }
        }

        let n = match tun.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!("tun: read: {}", e);
                continue;
            }
        };

        let datagram = strip_af_prefix(&buf[..n]);
        let mut link = TunLink(&mut tun);
        router.ingress(datagram, &mut link);
    }
}
