//! Handshake message codec: the ClientHello/ClientKeyExchange parsers and
//! the builders for the server flight. Every message is (type ∥ u24 length
//! ∥ body); the raw bytes of each feed the transcript.

use crate::err::Fatal;

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const CERTIFICATE: u8 = 11;
pub const SERVER_KEY_EXCHANGE: u8 = 12;
pub const SERVER_HELLO_DONE: u8 = 14;
pub const CLIENT_KEY_EXCHANGE: u8 = 16;
pub const FINISHED: u8 = 20;

pub const SUITE_ECDHE_RSA_AES128_GCM_SHA256: u16 = 0xc02f;
pub const GROUP_SECP256R1: u16 = 0x0017;
pub const SIG_RSA_PKCS1_SHA256: u16 = 0x0401;

const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;

const UNCOMPRESSED_POINT_LEN: usize = 65;

fn u24(value: usize) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Wraps a body into a full handshake message.
pub fn message(typ: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(typ);
    msg.extend_from_slice(&u24(body.len()));
    msg.extend_from_slice(body);
    msg
}

/// Pops one complete handshake message (header included) off the front of
/// the reassembly buffer; messages may span record boundaries.
pub fn take_message(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 4 {
        return None;
    }

    let len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if buf.len() < 4 + len {
        return None;
    }

    let raw: Vec<u8> = buf.drain(..4 + len).collect();
    Some((raw[0], raw))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Fatal> {
        if self.buf.len() < n {
            return Err(Fatal::Tls("truncated handshake message"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Fatal> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Fatal> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Result<&'a [u8], Fatal> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn vec16(&mut self) -> Result<&'a [u8], Fatal> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn done(&self) -> bool {
        self.buf.is_empty()
    }
}

fn u16_list(buf: &[u8]) -> Result<Vec<u16>, Fatal> {
    if buf.len() % 2 != 0 {
        return Err(Fatal::Tls("odd u16 list length"));
    }
    Ok(buf.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}

#[derive(Debug)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression: Vec<u8>,
    pub groups: Vec<u16>,
    pub sig_algs: Vec<u16>,
    pub alpn: Vec<Vec<u8>>,
}

pub fn parse_client_hello(body: &[u8]) -> Result<ClientHello, Fatal> {
    let mut r = Reader::new(body);

    let _legacy_version = r.u16()?;
    let random: [u8; 32] = r.take(32)?.try_into().unwrap();
    let session_id = r.vec8()?.to_vec();
    let cipher_suites = u16_list(r.vec16()?)?;
    let compression = r.vec8()?.to_vec();

    let mut groups = Vec::new();
    let mut sig_algs = Vec::new();
    let mut alpn = Vec::new();

    if !r.done() {
        let mut exts = Reader::new(r.vec16()?);
        while !exts.done() {
            let typ = exts.u16()?;
            let data = exts.vec16()?;
            let mut ext = Reader::new(data);
            match typ {
                EXT_SUPPORTED_GROUPS => groups = u16_list(ext.vec16()?)?,
                EXT_SIGNATURE_ALGORITHMS => sig_algs = u16_list(ext.vec16()?)?,
                EXT_ALPN => {
                    let mut names = Reader::new(ext.vec16()?);
                    while !names.done() {
                        alpn.push(names.vec8()?.to_vec());
                    }
                }
                _ => {} // unknown extensions are skipped whole
            }
        }
    }

    Ok(ClientHello {
        random,
        session_id,
        cipher_suites,
        compression,
        groups,
        sig_algs,
        alpn,
    })
}

/// ServerHello: our random, a 32-byte zero session id, suite 0xC02F, null
/// compression, and the selected ALPN protocol if the client offered one.
pub fn server_hello(server_random: &[u8; 32], alpn: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::with_capacity(76);
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(server_random);
    body.push(32);
    body.extend_from_slice(&[0u8; 32]);
    body.extend_from_slice(&SUITE_ECDHE_RSA_AES128_GCM_SHA256.to_be_bytes());
    body.push(0);

    if let Some(proto) = alpn {
        let mut list = Vec::with_capacity(1 + proto.len());
        list.push(proto.len() as u8);
        list.extend_from_slice(proto);

        let mut exts = Vec::new();
        exts.extend_from_slice(&EXT_ALPN.to_be_bytes());
        exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
        exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
        exts.extend_from_slice(&list);

        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);
    }

    message(SERVER_HELLO, &body)
}

/// Certificate: a chain of one DER certificate, doubly length-prefixed.
pub fn certificate(cert_der: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + cert_der.len());
    body.extend_from_slice(&u24(cert_der.len() + 3));
    body.extend_from_slice(&u24(cert_der.len()));
    body.extend_from_slice(cert_der);
    message(CERTIFICATE, &body)
}

/// The signed ECDH parameter block: named_curve ∥ secp256r1 ∥ point.
pub fn ecdh_params(point: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(4 + point.len());
    params.push(3); // curve type: named_curve
    params.extend_from_slice(&GROUP_SECP256R1.to_be_bytes());
    params.push(point.len() as u8);
    params.extend_from_slice(point);
    params
}

pub fn server_key_exchange(params: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(params.len() + 4 + signature.len());
    body.extend_from_slice(params);
    body.extend_from_slice(&SIG_RSA_PKCS1_SHA256.to_be_bytes());
    body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    body.extend_from_slice(signature);
    message(SERVER_KEY_EXCHANGE, &body)
}

pub fn server_hello_done() -> Vec<u8> {
    message(SERVER_HELLO_DONE, &[])
}

pub fn finished(verify_data: &[u8; 12]) -> Vec<u8> {
    message(FINISHED, verify_data)
}

/// ClientKeyExchange carries the client's ephemeral point, uncompressed.
pub fn parse_client_key_exchange(body: &[u8]) -> Result<Vec<u8>, Fatal> {
    let mut r = Reader::new(body);
    let point = r.vec8()?;

    if point.len() != UNCOMPRESSED_POINT_LEN || point[0] != 4 {
        return Err(Fatal::Tls("client point not uncompressed SEC1"));
    }
    if !r.done() {
        return Err(Fatal::Tls("trailing bytes in ClientKeyExchange"));
    }

    Ok(point.to_vec())
}
