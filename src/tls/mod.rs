//! TLS 1.2 server session for exactly one cipher suite:
//! TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 (0xC02F).

use std::sync::Arc;

use log::{debug, info, warn};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::signature::{SignatureEncoding, Signer};

use crate::err::Fatal;
use crate::http1::Http1;
use crate::http2::Http2;
use crate::keys::Identity;
use crate::pause::{Layer, Pause};

pub mod handshake;
pub mod prf;
pub mod record;

use record::RecordCipher;

pub const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_BAD_RECORD_MAC: u8 = 20;
const ALERT_HANDSHAKE_FAILURE: u8 = 40;
const ALERT_INTERNAL_ERROR: u8 = 80;

const LEVEL_WARNING: u8 = 1;
const LEVEL_FATAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    ExpectClientHello,
    ExpectClientKeyExchange,
    ExpectChangeCipherSpec,
    ExpectFinished,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    H2,
    Http11,
    None,
}

/// What a chunk of ingress produced: bytes for the transport to send,
/// whether to close cleanly afterwards, and whether the connection is to
/// be destroyed (alert bytes, if any, are already in `wire`).
#[derive(Debug, Default)]
pub struct Flow {
    pub wire: Vec<u8>,
    pub close: bool,
    pub fatal: Option<Fatal>,
}

enum App {
    Idle,
    H2(Http2),
    H1(Http1),
}

pub struct Session {
    identity: Arc<Identity>,
    state: HandshakeState,
    alpn: Alpn,

    buf: Vec<u8>,    // record reassembly
    hs_buf: Vec<u8>, // handshake message reassembly
    transcript: Vec<u8>,

    client_random: [u8; 32],
    server_random: [u8; 32],
    ecdh: Option<EphemeralSecret>,
    master: Option<[u8; prf::MASTER_LEN]>,
    keys: Option<prf::KeyBlock>,

    recv: Option<RecordCipher>,
    send: Option<RecordCipher>,

    app: App,
}

impl Session {
    pub fn new(identity: Arc<Identity>) -> Self {
        Session {
            identity,
            state: HandshakeState::ExpectClientHello,
            alpn: Alpn::None,
            buf: Vec::new(),
            hs_buf: Vec::new(),
            transcript: Vec::new(),
            client_random: [0; 32],
            server_random: [0; 32],
            ecdh: None,
            master: None,
            keys: None,
            recv: None,
            send: None,
            app: App::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feeds transport bytes into the session. Never returns `Err`: a
    /// fatal failure comes back inside the `Flow` with the best-effort
    /// alert already appended to `wire`.
    pub fn ingest(&mut self, data: &[u8], pause: &Pause) -> Flow {
        let mut flow = Flow::default();
        match self.drive(data, &mut flow.wire, pause) {
            Ok(close) => flow.close = close,
            Err(fatal) => {
                if !matches!(fatal, Fatal::PeerAlert(_)) {
                    let desc = self.alert_description(&fatal);
                    self.append_alert(&mut flow.wire, LEVEL_FATAL, desc);
                }
                self.state = HandshakeState::Closed;
                flow.fatal = Some(fatal);
            }
        }
        flow
    }

    /// The transport is closing underneath us (peer FIN): answer with a
    /// close_notify while the record channel still exists.
    pub fn close_notify(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.state == HandshakeState::Established {
            self.append_alert(&mut out, LEVEL_WARNING, ALERT_CLOSE_NOTIFY);
            self.state = HandshakeState::Closed;
        }
        out
    }

    fn drive(&mut self, data: &[u8], out: &mut Vec<u8>, pause: &Pause) -> Result<bool, Fatal> {
        self.buf.extend_from_slice(data);
        let mut close = false;

        while let Some((content_type, fragment)) = record::take(&mut self.buf)? {
            pause.pause(Layer::Tls);

            let plaintext = match &mut self.recv {
                Some(cipher) => cipher.open(content_type, &fragment)?,
                None => fragment,
            };
            debug!("tls: record type={} len={}", content_type, plaintext.len());

            match content_type {
                record::HANDSHAKE => self.on_handshake_fragment(&plaintext, out)?,
                record::CHANGE_CIPHER_SPEC => self.on_change_cipher_spec(&plaintext)?,
                record::ALERT => close |= self.on_alert(&plaintext, out)?,
                record::APPLICATION_DATA => close |= self.on_app_data(&plaintext, out, pause)?,
                _ => return Err(Fatal::Tls("unknown record content type")),
            }
        }

        Ok(close)
    }

    fn on_handshake_fragment(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), Fatal> {
        self.hs_buf.extend_from_slice(plaintext);
        while let Some((typ, raw)) = handshake::take_message(&mut self.hs_buf) {
            self.on_handshake_message(typ, raw, out)?;
        }
        Ok(())
    }

    fn on_handshake_message(&mut self, typ: u8, raw: Vec<u8>, out: &mut Vec<u8>) -> Result<(), Fatal> {
        let body = &raw[4..];
        match (self.state, typ) {
            (HandshakeState::ExpectClientHello, handshake::CLIENT_HELLO) => {
                let hello = handshake::parse_client_hello(body)?;

                if !hello
                    .cipher_suites
                    .contains(&handshake::SUITE_ECDHE_RSA_AES128_GCM_SHA256)
                {
                    return Err(Fatal::Unsupported("cipher suite"));
                }
                if !hello.compression.contains(&0) {
                    return Err(Fatal::Unsupported("compression"));
                }
                if !hello.groups.contains(&handshake::GROUP_SECP256R1) {
                    return Err(Fatal::Unsupported("named group"));
                }
                if !hello.sig_algs.contains(&handshake::SIG_RSA_PKCS1_SHA256) {
                    return Err(Fatal::Unsupported("signature algorithm"));
                }

                self.client_random = hello.random;
                self.alpn = if hello.alpn.iter().any(|p| p == b"h2") {
                    Alpn::H2
                } else if hello.alpn.iter().any(|p| p == b"http/1.1") {
                    Alpn::Http11
                } else {
                    Alpn::None
                };
                info!(
                    "tls: ClientHello, {} suites, alpn={:?}",
                    hello.cipher_suites.len(),
                    self.alpn
                );

                self.transcript.extend_from_slice(&raw);
                self.send_server_flight(out)?;
                self.state = HandshakeState::ExpectClientKeyExchange;
            }

            (HandshakeState::ExpectClientKeyExchange, handshake::CLIENT_KEY_EXCHANGE) => {
                self.transcript.extend_from_slice(&raw);

                let point = handshake::parse_client_key_exchange(body)?;
                let client_public = PublicKey::from_sec1_bytes(&point)
                    .map_err(|_| Fatal::Tls("client point not on curve"))?;

                let ecdh = self.ecdh.take().ok_or(Fatal::Tls("ephemeral key missing"))?;
                let shared = ecdh.diffie_hellman(&client_public);
                let premaster = shared.raw_secret_bytes();

                let master =
                    prf::master_secret(premaster.as_slice(), &self.client_random, &self.server_random);
                self.keys = Some(prf::key_block(&master, &self.client_random, &self.server_random));
                self.master = Some(master);
                debug!("tls: ClientKeyExchange, key block derived");

                self.state = HandshakeState::ExpectChangeCipherSpec;
            }

            (HandshakeState::ExpectFinished, handshake::FINISHED) => {
                let master = self.master.as_ref().ok_or(Fatal::Tls("master secret missing"))?;
                let expected = prf::verify_data(
                    master,
                    b"client finished",
                    &prf::transcript_hash(&self.transcript),
                );
                if body != expected.as_slice() {
                    return Err(Fatal::BadFinished);
                }
                self.transcript.extend_from_slice(&raw);
                info!("tls: client Finished verified");

                // CCS out, arm our sending direction at sequence 0
                record::encode(record::CHANGE_CIPHER_SPEC, &[1], out);
                let keys = self.keys.as_ref().ok_or(Fatal::Tls("key block missing"))?;
                self.send = Some(RecordCipher::new(&keys.server_key, keys.server_iv));

                let verify = prf::verify_data(
                    master,
                    b"server finished",
                    &prf::transcript_hash(&self.transcript),
                );
                let finished = handshake::finished(&verify);
                self.transcript.extend_from_slice(&finished);
                self.seal_into(record::HANDSHAKE, &finished, out)?;

                self.state = HandshakeState::Established;
                self.app = match self.alpn {
                    Alpn::H2 => App::H2(Http2::new()),
                    _ => App::H1(Http1::new()),
                };
                info!("tls: established, alpn={:?}", self.alpn);
            }

            _ => {
                warn!("tls: handshake message {} in state {:?}", typ, self.state);
                return Err(Fatal::Tls("handshake message out of order"));
            }
        }
        Ok(())
    }

    fn send_server_flight(&mut self, out: &mut Vec<u8>) -> Result<(), Fatal> {
        OsRng.fill_bytes(&mut self.server_random);

        let alpn: Option<&[u8]> = match self.alpn {
            Alpn::H2 => Some(b"h2"),
            Alpn::Http11 => Some(b"http/1.1"),
            Alpn::None => None,
        };
        let hello = handshake::server_hello(&self.server_random, alpn);
        let cert = handshake::certificate(&self.identity.cert_der);

        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let params = handshake::ecdh_params(point.as_bytes());
        self.ecdh = Some(secret);

        // signature covers both randoms and the parameter block
        let mut signed = Vec::with_capacity(64 + params.len());
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&params);
        let signature = self
            .identity
            .signer
            .try_sign(&signed)
            .map_err(|_| Fatal::Tls("rsa signing failed"))?
            .to_vec();

        let ske = handshake::server_key_exchange(&params, &signature);
        let done = handshake::server_hello_done();

        for msg in [&hello, &cert, &ske, &done] {
            self.transcript.extend_from_slice(msg);
            record::encode(record::HANDSHAKE, msg, out);
        }
        debug!(
            "tls: server flight out ({} handshake bytes)",
            hello.len() + cert.len() + ske.len() + done.len()
        );
        Ok(())
    }

    fn on_change_cipher_spec(&mut self, plaintext: &[u8]) -> Result<(), Fatal> {
        if self.state != HandshakeState::ExpectChangeCipherSpec {
            return Err(Fatal::Tls("ChangeCipherSpec out of order"));
        }
        if plaintext != [1u8].as_slice() {
            return Err(Fatal::Tls("bad ChangeCipherSpec body"));
        }

        let keys = self.keys.as_ref().ok_or(Fatal::Tls("key block missing"))?;
        self.recv = Some(RecordCipher::new(&keys.client_key, keys.client_iv));
        self.state = HandshakeState::ExpectFinished;
        debug!("tls: receive encryption armed");
        Ok(())
    }

    fn on_alert(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<bool, Fatal> {
        if plaintext.len() < 2 {
            return Err(Fatal::Tls("short alert"));
        }
        let (level, desc) = (plaintext[0], plaintext[1]);

        if desc == ALERT_CLOSE_NOTIFY {
            info!("tls: close_notify from peer");
            self.append_alert(out, LEVEL_WARNING, ALERT_CLOSE_NOTIFY);
            self.state = HandshakeState::Closed;
            return Ok(true);
        }

        if level == LEVEL_FATAL {
            return Err(Fatal::PeerAlert(desc));
        }
        warn!("tls: ignoring warning alert {}", desc);
        Ok(false)
    }

    fn on_app_data(
        &mut self,
        plaintext: &[u8],
        out: &mut Vec<u8>,
        pause: &Pause,
    ) -> Result<bool, Fatal> {
        if self.state != HandshakeState::Established {
            return Err(Fatal::Tls("application data outside established state"));
        }

        let mut upward = Vec::new();
        let result = match &mut self.app {
            App::H2(h2) => h2.ingest(plaintext, &mut upward, pause),
            App::H1(h1) => h1.ingest(plaintext, &mut upward),
            App::Idle => Err(Fatal::Tls("application data with no protocol")),
        };

        if !upward.is_empty() {
            self.seal_into(record::APPLICATION_DATA, &upward, out)?;
        }

        let close = result?;
        if close {
            self.append_alert(out, LEVEL_WARNING, ALERT_CLOSE_NOTIFY);
            self.state = HandshakeState::Closed;
        }
        Ok(close)
    }

    fn seal_into(&mut self, content_type: u8, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), Fatal> {
        let cipher = self.send.as_mut().ok_or(Fatal::Tls("send cipher not armed"))?;
        let fragment = cipher.seal(content_type, plaintext)?;
        record::encode(content_type, &fragment, out);
        Ok(())
    }

    /// Best effort: encode through the armed cipher if there is one,
    /// in the clear otherwise. Failures are swallowed.
    fn append_alert(&mut self, out: &mut Vec<u8>, level: u8, desc: u8) {
        let body = [level, desc];
        match self.send.as_mut() {
            Some(cipher) => {
                if let Ok(fragment) = cipher.seal(record::ALERT, &body) {
                    record::encode(record::ALERT, &fragment, out);
                }
            }
            None => record::encode(record::ALERT, &body, out),
        }
    }

    fn alert_description(&self, fatal: &Fatal) -> u8 {
        match fatal {
            Fatal::BadRecordMac => ALERT_BAD_RECORD_MAC,
            _ if self.send.is_none() => ALERT_HANDSHAKE_FAILURE,
            _ => ALERT_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rsa::RsaPrivateKey;

    fn test_identity() -> Arc<Identity> {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        Arc::new(Identity::from_parts(key, vec![0x30, 0x03, 0x02, 0x01, 0x00]))
    }

    fn client_hello_body(suites: &[u16], groups: &[u16], sig_algs: &[u16]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0x42u8; 32]);
        body.push(0);
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for s in suites {
            body.extend_from_slice(&s.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]);

        let mut exts = Vec::new();
        exts.extend_from_slice(&0x000au16.to_be_bytes());
        exts.extend_from_slice(&((groups.len() * 2 + 2) as u16).to_be_bytes());
        exts.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
        for g in groups {
            exts.extend_from_slice(&g.to_be_bytes());
        }
        exts.extend_from_slice(&0x000du16.to_be_bytes());
        exts.extend_from_slice(&((sig_algs.len() * 2 + 2) as u16).to_be_bytes());
        exts.extend_from_slice(&((sig_algs.len() * 2) as u16).to_be_bytes());
        for s in sig_algs {
            exts.extend_from_slice(&s.to_be_bytes());
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);
        body
    }

    fn ingest_hello(session: &mut Session, body: &[u8]) -> Flow {
        let msg = handshake::message(handshake::CLIENT_HELLO, body);
        let mut wire = Vec::new();
        record::encode(record::HANDSHAKE, &msg, &mut wire);
        session.ingest(&wire, &Pause::none())
    }

    #[test]
    fn client_hello_produces_server_flight() {
        let mut session = Session::new(test_identity());
        let body = client_hello_body(&[0xc02f], &[23], &[0x0401]);

        let flow = ingest_hello(&mut session, &body);
        assert!(flow.fatal.is_none());
        assert_eq!(session.state(), HandshakeState::ExpectClientKeyExchange);

        // four plaintext handshake records: ServerHello, Certificate,
        // ServerKeyExchange, ServerHelloDone
        let mut wire = flow.wire;
        let mut types = Vec::new();
        while let Some((content_type, fragment)) = record::take(&mut wire).unwrap() {
            assert_eq!(content_type, record::HANDSHAKE);
            types.push(fragment[0]);
        }
        assert_eq!(
            types,
            vec![
                handshake::SERVER_HELLO,
                handshake::CERTIFICATE,
                handshake::SERVER_KEY_EXCHANGE,
                handshake::SERVER_HELLO_DONE
            ]
        );
    }

    #[test]
    fn missing_group_is_fatal_with_alert() {
        let mut session = Session::new(test_identity());
        let body = client_hello_body(&[0xc02f], &[0x001d], &[0x0401]);

        let flow = ingest_hello(&mut session, &body);
        assert!(matches!(flow.fatal, Some(Fatal::Unsupported("named group"))));

        // a plaintext fatal handshake_failure alert rides along
        let mut wire = flow.wire;
        let (content_type, fragment) = record::take(&mut wire).unwrap().unwrap();
        assert_eq!(content_type, record::ALERT);
        assert_eq!(fragment, vec![2, 40]);
    }

    #[test]
    fn missing_suite_is_fatal() {
        let mut session = Session::new(test_identity());
        let body = client_hello_body(&[0x1301], &[23], &[0x0401]);
        let flow = ingest_hello(&mut session, &body);
        assert!(matches!(flow.fatal, Some(Fatal::Unsupported("cipher suite"))));
    }

    #[test]
    fn records_reassemble_across_chunks() {
        let mut session = Session::new(test_identity());
        let body = client_hello_body(&[0xc02f], &[23], &[0x0401]);
        let msg = handshake::message(handshake::CLIENT_HELLO, &body);
        let mut wire = Vec::new();
        record::encode(record::HANDSHAKE, &msg, &mut wire);

        // drip the record in three slices, mimicking TCP segmentation
        let flow = session.ingest(&wire[..3], &Pause::none());
        assert!(flow.wire.is_empty() && flow.fatal.is_none());
        let flow = session.ingest(&wire[3..10], &Pause::none());
        assert!(flow.wire.is_empty() && flow.fatal.is_none());
        let flow = session.ingest(&wire[10..], &Pause::none());
        assert!(flow.fatal.is_none());
        assert!(!flow.wire.is_empty());
    }

    #[test]
    fn app_data_before_handshake_is_fatal() {
        let mut session = Session::new(test_identity());
        let mut wire = Vec::new();
        record::encode(record::APPLICATION_DATA, b"early", &mut wire);
        let flow = session.ingest(&wire, &Pause::none());
        assert!(flow.fatal.is_some());
    }

    #[test]
    fn out_of_order_handshake_is_fatal() {
        let mut session = Session::new(test_identity());
        let msg = handshake::message(handshake::CLIENT_KEY_EXCHANGE, &[0]);
        let mut wire = Vec::new();
        record::encode(record::HANDSHAKE, &msg, &mut wire);
        let flow = session.ingest(&wire, &Pause::none());
        assert!(flow.fatal.is_some());
    }
}
