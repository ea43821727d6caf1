use std::fmt;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info};

use crate::err::Fatal;
use crate::http1::Http1;
use crate::keys::Identity;
use crate::pause::Pause;
use crate::tls::{Flow, Session};
use crate::wire::tcp::{flags, TcpHeader};
use crate::PORT_HTTPS;

mod ioutil;

pub use ioutil::*;

// conservative MSS for a 1500-byte MTU link, options-free headers
const MSS: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ipv4, self.port)
    }
}

/// The connection key, oriented from the client: `src` is the peer that
/// sent the SYN, `dst` is the listening side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/*
            Passive-open subset of RFC 9293 S3.3.2 Fig 5

                              +---------+
                              |  LISTEN |  (implicit: the bound ports)
                              +---------+
                           rcv SYN  |
                       snd SYN,ACK  V
                              +---------+
                              |SYN-RCVD |
                              +---------+
                    rcv ACK of SYN  |
                                    V
         snd FIN            +---------+   rcv FIN, snd ACK
       /------------------- |  ESTAB  | -------------------\
       V                    +---------+                     V
  +---------+                                          +---------+
  |  FIN    | rcv ACK   +---------+                    |  CLOSE  |
  | WAIT-1  |---------->|FINWAIT-2|                    |   WAIT  |
  +---------+           +---------+                    +---------+
       | rcv FIN             | rcv FIN                 snd FIN |
       | snd ACK             | snd ACK                         V
       V                     V                         +---------+
  +---------+           +---------+                    | LAST-ACK|
  | CLOSING |---------->|TIME-WAIT| (destroyed)        +---------+
  +---------+ rcv ACK   +---------+                rcv ACK |
                             ^                             V
                             \------------------------ destroyed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    SynRcvd,
    Estab,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    Closed,
}

/// What the dispatcher should do with the table entry afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep,
    Destroy,
}

enum Upper {
    Tls(Session),
    Http(Http1),
}

/// One TCP connection and everything stacked on top of it. The TLS and
/// HTTP/2 state live inside `upper`; no layer holds a pointer back down.
pub struct Connection {
    quad: Quad,
    state: State,
    iss: u32,
    irs: u32,
    rcv_nxt: u32,
    snd_nxt: u32,
    snd_una: u32,
    upper: Upper,
}

impl Connection {
    /// Passive open: a SYN arrived on a listening port. Replies SYN|ACK
    /// and enters SYN_RECEIVED.
    pub fn open<W: Write>(
        quad: Quad,
        tcph: &TcpHeader,
        identity: &Arc<Identity>,
        link: &mut W,
    ) -> io::Result<Connection> {
        let iss: u32 = rand::random();
        let irs = tcph.seq;

        let upper = match quad.dst.port {
            PORT_HTTPS => Upper::Tls(Session::new(identity.clone())),
            _ => Upper::Http(Http1::new()),
        };

        let conn = Connection {
            quad,
            state: State::SynRcvd,
            iss,
            irs,
            rcv_nxt: irs.wrapping_add(1),
            snd_nxt: iss.wrapping_add(1),
            snd_una: iss,
            upper,
        };

        info!("tcp: {} SYN, iss={}", quad, iss);
        ioutil::write_synack(link, quad, iss, conn.rcv_nxt)?;
        Ok(conn)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn on_segment<W: Write>(
        &mut self,
        tcph: &TcpHeader,
        payload: &[u8],
        link: &mut W,
        pause: &Pause,
    ) -> Result<Action, Fatal> {
        if tcph.has(flags::RST) {
            info!("tcp: {} RST from peer", self.quad);
            return Ok(Action::Destroy);
        }

        match self.state {
            State::SynRcvd => {
                if tcph.has(flags::SYN) {
                    debug!("tcp: {} retransmitted SYN, resending SYN|ACK", self.quad);
                    ioutil::write_synack(link, self.quad, self.iss, self.rcv_nxt)?;
                    return Ok(Action::Keep);
                }
                if tcph.has(flags::ACK) && tcph.ack == self.snd_nxt {
                    self.snd_una = tcph.ack;
                    self.state = State::Estab;
                    info!("tcp: {} established", self.quad);
                    if !payload.is_empty() || tcph.has(flags::FIN) {
                        return self.on_established(tcph, payload, link, pause);
                    }
                    return Ok(Action::Keep);
                }
                debug!("tcp: {} unexpected segment in SYN_RCVD, ignoring", self.quad);
                Ok(Action::Keep)
            }

            State::Estab => self.on_established(tcph, payload, link, pause),

            State::LastAck => {
                if tcph.has(flags::ACK) && tcph.ack == self.snd_nxt {
                    self.state = State::Closed;
                    info!("tcp: {} closed", self.quad);
                    return Ok(Action::Destroy);
                }
                Ok(Action::Keep)
            }

            State::FinWait1 | State::FinWait2 => self.on_fin_wait(tcph, payload, link),

            State::Closing => {
                if tcph.has(flags::ACK) && tcph.ack == self.snd_nxt {
                    self.state = State::TimeWait;
                    info!("tcp: {} closed (simultaneous close)", self.quad);
                    return Ok(Action::Destroy);
                }
                Ok(Action::Keep)
            }

            // transient states: nothing should reach a connection here
            State::CloseWait | State::TimeWait | State::Closed => {
                debug!("tcp: {} segment in {:?}, ignoring", self.quad, self.state);
                Ok(Action::Keep)
            }
        }
    }

    fn on_established<W: Write>(
        &mut self,
        tcph: &TcpHeader,
        payload: &[u8],
        link: &mut W,
        pause: &Pause,
    ) -> Result<Action, Fatal> {
        if !payload.is_empty() {
            if tcph.seq != self.rcv_nxt {
                // out-of-order or retransmitted: drop, and per the
                // tie-break also discard any ACK the segment carried
                debug!(
                    "tcp: {} seq={} expected={}, dropping {} bytes",
                    self.quad,
                    tcph.seq,
                    self.rcv_nxt,
                    payload.len()
                );
                return Ok(Action::Keep);
            }

            if tcph.has(flags::ACK) {
                self.snd_una = tcph.ack;
            }

            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
            ioutil::write_ack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;
            debug!("tcp: {} {} bytes in order", self.quad, payload.len());

            let flow = self.deliver(payload, pause);
            self.transmit(&flow.wire, link)?;

            if let Some(fatal) = flow.fatal {
                // the best-effort alert is already on the wire; tear down
                let _ = ioutil::write_rst(link, self.quad, self.snd_nxt, self.rcv_nxt);
                return Err(fatal);
            }
            if flow.close && self.state == State::Estab {
                ioutil::write_finack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                self.state = State::FinWait1;
                info!("tcp: {} local close (FIN sent)", self.quad);
            }
        } else if tcph.has(flags::ACK) && !tcph.has(flags::FIN) {
            if tcph.ack != self.snd_una {
                debug!("tcp: {} ack advanced to {}", self.quad, tcph.ack);
            }
            self.snd_una = tcph.ack;
        }

        if tcph.has(flags::FIN) && self.state == State::Estab {
            if tcph.seq.wrapping_add(payload.len() as u32) != self.rcv_nxt {
                debug!("tcp: {} FIN out of order, ignoring", self.quad);
                return Ok(Action::Keep);
            }

            info!("tcp: {} FIN from peer", self.quad);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.state = State::CloseWait;
            ioutil::write_ack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;

            // say goodbye at the TLS layer while the channel still exists
            let goodbye = match &mut self.upper {
                Upper::Tls(session) => session.close_notify(),
                Upper::Http(_) => Vec::new(),
            };
            self.transmit(&goodbye, link)?;

            ioutil::write_finack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.state = State::LastAck;
        }

        Ok(Action::Keep)
    }

    /// We closed first. The peer may still ACK our FIN, send trailing
    /// data (absorbed and discarded), and finally FIN.
    fn on_fin_wait<W: Write>(
        &mut self,
        tcph: &TcpHeader,
        payload: &[u8],
        link: &mut W,
    ) -> Result<Action, Fatal> {
        if tcph.has(flags::ACK) && tcph.ack == self.snd_nxt && self.state == State::FinWait1 {
            self.snd_una = tcph.ack;
            self.state = State::FinWait2;
            debug!("tcp: {} FIN acknowledged", self.quad);
        }

        let mut fin_seq = tcph.seq;
        if !payload.is_empty() {
            if tcph.seq != self.rcv_nxt {
                debug!("tcp: {} out-of-order after close, dropping", self.quad);
                return Ok(Action::Keep);
            }
            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
            fin_seq = fin_seq.wrapping_add(payload.len() as u32);
            debug!(
                "tcp: {} discarding {} bytes after local close",
                self.quad,
                payload.len()
            );
            if !tcph.has(flags::FIN) {
                ioutil::write_ack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;
            }
        }

        if tcph.has(flags::FIN) {
            if fin_seq != self.rcv_nxt {
                debug!("tcp: {} FIN out of order, ignoring", self.quad);
                return Ok(Action::Keep);
            }
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            ioutil::write_ack(link, self.quad, self.snd_nxt, self.rcv_nxt)?;

            if self.state == State::FinWait2 {
                // TIME_WAIT shortcut: destroyed as soon as the FIN is acked
                self.state = State::TimeWait;
                info!("tcp: {} closed", self.quad);
                return Ok(Action::Destroy);
            }
            self.state = State::Closing;
        }

        Ok(Action::Keep)
    }

    fn deliver(&mut self, payload: &[u8], pause: &Pause) -> Flow {
        match &mut self.upper {
            Upper::Tls(session) => session.ingest(payload, pause),
            Upper::Http(h1) => {
                let mut wire = Vec::new();
                match h1.ingest(payload, &mut wire) {
                    Ok(close) => Flow {
                        wire,
                        close,
                        fatal: None,
                    },
                    Err(fatal) => Flow {
                        wire,
                        close: false,
                        fatal: Some(fatal),
                    },
                }
            }
        }
    }

    /// Sends application bytes as ACK|PSH segments of at most MSS bytes.
    fn transmit<W: Write>(&mut self, data: &[u8], link: &mut W) -> io::Result<()> {
        for chunk in data.chunks(MSS) {
            ioutil::write_data(link, self.quad, self.snd_nxt, self.rcv_nxt, chunk)?;
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    use crate::wire::ipv4::Ipv4Header;
    use crate::wire::tcp::build_segment;
    use crate::PORT_HTTP;

    /// Captures one egress datagram per write call.
    struct Link(Vec<Vec<u8>>);

    impl Write for Link {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link {
        fn new() -> Self {
            Link(Vec::new())
        }

        fn drain(&mut self) -> Vec<(TcpHeader, Vec<u8>)> {
            self.0
                .drain(..)
                .map(|datagram| {
                    let (_, segment) = Ipv4Header::parse(&datagram).unwrap();
                    let (tcph, payload) = TcpHeader::parse(segment).unwrap();
                    (tcph, payload.to_vec())
                })
                .collect()
        }
    }

    fn identity() -> Arc<Identity> {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        Arc::new(Identity::from_parts(key, vec![0x30, 0x03, 0x02, 0x01, 0x00]))
    }

    fn quad(port: u16) -> Quad {
        Quad {
            src: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 2),
                port: 40000,
            },
            dst: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port,
            },
        }
    }

    fn segment(quad: Quad, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> (TcpHeader, Vec<u8>) {
        let raw = build_segment(
            (quad.src.ipv4, quad.src.port),
            (quad.dst.ipv4, quad.dst.port),
            seq,
            ack,
            flags,
            payload,
        );
        let (tcph, data) = TcpHeader::parse(&raw).unwrap();
        (tcph, data.to_vec())
    }

    fn established(port: u16) -> (Connection, Link, u32, u32) {
        let quad = quad(port);
        let mut link = Link::new();

        let (syn, _) = segment(quad, 1000, 0, flags::SYN, &[]);
        let mut conn = Connection::open(quad, &syn, &identity(), &mut link).unwrap();

        let replies = link.drain();
        let (synack, _) = &replies[0];
        assert_eq!(synack.flags, flags::SYN | flags::ACK);
        assert_eq!(synack.ack, 1001);
        let server_isn = synack.seq;

        let (ack, _) = segment(quad, 1001, server_isn.wrapping_add(1), flags::ACK, &[]);
        assert_eq!(
            conn.on_segment(&ack, &[], &mut link, &Pause::none()).unwrap(),
            Action::Keep
        );
        assert_eq!(conn.state(), State::Estab);

        (conn, link, 1001, server_isn.wrapping_add(1))
    }

    #[test]
    fn three_way_handshake() {
        let (conn, _, cseq, _) = established(PORT_HTTP);
        assert_eq!(conn.irs, 1000);
        assert_eq!(conn.rcv_nxt, cseq);
        assert_eq!(conn.snd_una, conn.snd_nxt);
    }

    #[test]
    fn http_request_gets_acked_response_and_server_fin() {
        let (mut conn, mut link, cseq, sseq) = established(PORT_HTTP);
        let q = quad(PORT_HTTP);

        let request = b"GET / HTTP/1.1\r\n\r\n";
        let (tcph, payload) = segment(q, cseq, sseq, flags::ACK | flags::PSH, request);
        conn.on_segment(&tcph, &payload, &mut link, &Pause::none())
            .unwrap();

        let replies = link.drain();
        // ACK of the request, the response data, then our FIN
        assert_eq!(replies[0].0.flags, flags::ACK);
        assert_eq!(replies[0].0.ack, cseq + request.len() as u32);

        assert_eq!(replies[1].0.flags, flags::ACK | flags::PSH);
        let text = String::from_utf8(replies[1].1.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK"));

        assert_eq!(replies[2].0.flags, flags::FIN | flags::ACK);
        assert_eq!(conn.state(), State::FinWait1);

        // sequence invariant: N bytes delivered upward
        assert_eq!(conn.rcv_nxt, conn.irs + 1 + request.len() as u32);

        // peer acks our FIN, then FINs; we ack and the entry dies
        let fin_seq = cseq + request.len() as u32;
        let our_fin = replies[2].0.seq.wrapping_add(1);

        let (tcph, _) = segment(q, fin_seq, our_fin, flags::ACK, &[]);
        assert_eq!(
            conn.on_segment(&tcph, &[], &mut link, &Pause::none()).unwrap(),
            Action::Keep
        );
        assert_eq!(conn.state(), State::FinWait2);

        let (tcph, _) = segment(q, fin_seq, our_fin, flags::FIN | flags::ACK, &[]);
        assert_eq!(
            conn.on_segment(&tcph, &[], &mut link, &Pause::none()).unwrap(),
            Action::Destroy
        );
        assert_eq!(link.drain().last().unwrap().0.ack, fin_seq + 1);
    }

    #[test]
    fn peer_close_runs_last_ack_path() {
        let (mut conn, mut link, cseq, sseq) = established(PORT_HTTPS);
        let q = quad(PORT_HTTPS);

        let (fin, _) = segment(q, cseq, sseq, flags::FIN | flags::ACK, &[]);
        assert_eq!(
            conn.on_segment(&fin, &[], &mut link, &Pause::none()).unwrap(),
            Action::Keep
        );
        assert_eq!(conn.state(), State::LastAck);

        let replies = link.drain();
        // ACK of the FIN, then our own FIN|ACK; no close_notify because
        // the TLS session never reached established
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0.flags, flags::ACK);
        assert_eq!(replies[0].0.ack, cseq + 1);
        assert_eq!(replies[1].0.flags, flags::FIN | flags::ACK);

        let (ack, _) = segment(q, cseq + 1, replies[1].0.seq.wrapping_add(1), flags::ACK, &[]);
        assert_eq!(
            conn.on_segment(&ack, &[], &mut link, &Pause::none()).unwrap(),
            Action::Destroy
        );
    }

    #[test]
    fn out_of_order_payload_is_dropped_silently() {
        let (mut conn, mut link, cseq, sseq) = established(PORT_HTTP);
        let q = quad(PORT_HTTP);

        let (tcph, payload) = segment(q, cseq + 500, sseq, flags::ACK | flags::PSH, b"stale");
        conn.on_segment(&tcph, &payload, &mut link, &Pause::none())
            .unwrap();

        assert!(link.drain().is_empty());
        assert_eq!(conn.rcv_nxt, cseq);
    }

    #[test]
    fn mismatched_seq_discards_ack_side_effect_too() {
        let (mut conn, mut link, cseq, sseq) = established(PORT_HTTP);
        let q = quad(PORT_HTTP);
        let una_before = conn.snd_una;

        // seq is wrong but the ack would advance: both must be ignored
        let (tcph, payload) = segment(q, cseq + 500, sseq.wrapping_add(100), flags::ACK, b"x");
        conn.on_segment(&tcph, &payload, &mut link, &Pause::none())
            .unwrap();

        assert_eq!(conn.snd_una, una_before);
        assert!(link.drain().is_empty());
    }

    #[test]
    fn rst_destroys_connection() {
        let (mut conn, mut link, cseq, sseq) = established(PORT_HTTP);
        let q = quad(PORT_HTTP);

        let (rst, _) = segment(q, cseq, sseq, flags::RST, &[]);
        assert_eq!(
            conn.on_segment(&rst, &[], &mut link, &Pause::none()).unwrap(),
            Action::Destroy
        );
    }

    #[test]
    fn retransmitted_syn_repeats_synack() {
        let q = quad(PORT_HTTP);
        let mut link = Link::new();

        let (syn, _) = segment(q, 1000, 0, flags::SYN, &[]);
        let mut conn = Connection::open(q, &syn, &identity(), &mut link).unwrap();
        let first = link.drain();

        conn.on_segment(&syn, &[], &mut link, &Pause::none()).unwrap();
        let second = link.drain();

        assert_eq!(first[0].0.seq, second[0].0.seq);
        assert_eq!(second[0].0.flags, flags::SYN | flags::ACK);
    }
}
