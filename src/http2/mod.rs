//! Minimal HTTP/2 service: preface check, SETTINGS handshake, and one
//! synchronous HEADERS/DATA response per request stream. No HPACK table;
//! the response header block is a hand-picked static-table encoding.

use log::{debug, info, warn};

use crate::err::Fatal;
use crate::pause::{Layer, Pause};

pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const SETTINGS: u8 = 0x4;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;

const ERR_PROTOCOL: u32 = 0x1;
const ERR_FRAME_SIZE: u32 = 0x6;

pub const RESPONSE_BODY: &[u8] = b"Hello from User-Space HTTP/2!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub typ: u8,
    pub flags: u8,
    pub stream: u32,
}

impl FrameHeader {
    /// The reserved top bit of the stream id is masked on parse.
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            len: ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32,
            typ: buf[3],
            flags: buf[4],
            stream: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = (self.len >> 16) as u8;
        buf[1] = (self.len >> 8) as u8;
        buf[2] = self.len as u8;
        buf[3] = self.typ;
        buf[4] = self.flags;
        buf[5..9].copy_from_slice(&(self.stream & 0x7fff_ffff).to_be_bytes());
        buf
    }
}

pub fn frame(typ: u8, flags: u8, stream: u32, payload: &[u8], out: &mut Vec<u8>) {
    let header = FrameHeader {
        len: payload.len() as u32,
        typ,
        flags,
        stream,
    };
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectPreface,
    ExpectSettings,
    Ready,
}

pub struct Http2 {
    state: State,
    buf: Vec<u8>,
    last_stream: u32,
}

impl Http2 {
    pub fn new() -> Self {
        Http2 {
            state: State::ExpectPreface,
            buf: Vec::new(),
            last_stream: 0,
        }
    }

    /// Feeds decrypted bytes; response frames are appended to `out`.
    /// Returns true when the peer asked to wind the connection down.
    pub fn ingest(&mut self, data: &[u8], out: &mut Vec<u8>, pause: &Pause) -> Result<bool, Fatal> {
        self.buf.extend_from_slice(data);

        if self.state == State::ExpectPreface {
            if self.buf.len() < PREFACE.len() {
                return Ok(false);
            }
            if self.buf[..PREFACE.len()] != PREFACE[..] {
                self.goaway(ERR_PROTOCOL, out);
                return Err(Fatal::Http2("bad connection preface"));
            }
            self.buf.drain(..PREFACE.len());
            info!("h2: connection preface ok");

            // our (empty) settings open the server side of the handshake
            frame(SETTINGS, 0, 0, &[], out);
            self.state = State::ExpectSettings;
        }

        let mut close = false;
        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return Ok(close);
            }
            let head = FrameHeader::parse(self.buf[..FRAME_HEADER_LEN].try_into().unwrap());
            if self.buf.len() < FRAME_HEADER_LEN + head.len as usize {
                // wait for the rest; consume nothing
                return Ok(close);
            }

            pause.pause(Layer::Http2);
            let payload: Vec<u8> =
                self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + head.len as usize].to_vec();
            self.buf.drain(..FRAME_HEADER_LEN + head.len as usize);

            close |= self.on_frame(head, &payload, out)?;
        }
    }

    fn on_frame(&mut self, head: FrameHeader, payload: &[u8], out: &mut Vec<u8>) -> Result<bool, Fatal> {
        debug!(
            "h2: frame type={:#x} flags={:#04x} stream={} len={}",
            head.typ, head.flags, head.stream, head.len
        );

        if self.state == State::ExpectSettings && head.typ != SETTINGS {
            warn!("h2: frame type {:#x} before settings handshake, discarding", head.typ);
            return Ok(false);
        }

        match head.typ {
            SETTINGS => {
                if head.stream != 0 {
                    warn!("h2: SETTINGS on stream {}, discarding", head.stream);
                    return Ok(false);
                }
                if head.flags & FLAG_ACK != 0 {
                    if !payload.is_empty() {
                        self.goaway(ERR_FRAME_SIZE, out);
                        return Err(Fatal::Http2("SETTINGS ack with payload"));
                    }
                    debug!("h2: SETTINGS ack");
                } else {
                    frame(SETTINGS, FLAG_ACK, 0, &[], out);
                    if self.state == State::ExpectSettings {
                        self.state = State::Ready;
                        info!("h2: ready");
                    }
                }
            }

            HEADERS => {
                if head.stream == 0 {
                    warn!("h2: HEADERS on stream 0, discarding");
                    return Ok(false);
                }
                self.last_stream = head.stream;
                info!("h2: request on stream {}", head.stream);

                // :status: 200 from the static table, then content-type:
                // text/plain as a literal without indexing (indexed name 31)
                let mut block = vec![0x88, 0x0f, 0x10];
                block.push(b"text/plain".len() as u8);
                block.extend_from_slice(b"text/plain");

                frame(HEADERS, FLAG_END_HEADERS, head.stream, &block, out);
                frame(DATA, FLAG_END_STREAM, head.stream, RESPONSE_BODY, out);
            }

            WINDOW_UPDATE => {
                if payload.len() != 4 {
                    self.goaway(ERR_FRAME_SIZE, out);
                    return Err(Fatal::Http2("WINDOW_UPDATE with bad length"));
                }
                // no flow-control bookkeeping: the increment is ignored
            }

            PING => {
                if head.stream != 0 {
                    warn!("h2: PING on stream {}, discarding", head.stream);
                    return Ok(false);
                }
                if payload.len() != 8 {
                    self.goaway(ERR_FRAME_SIZE, out);
                    return Err(Fatal::Http2("PING with bad length"));
                }
                if head.flags & FLAG_ACK == 0 {
                    frame(PING, FLAG_ACK, 0, payload, out);
                }
            }

            GOAWAY => {
                info!("h2: GOAWAY from peer");
                return Ok(true);
            }

            other => debug!("h2: ignoring frame type {:#x}", other),
        }

        Ok(false)
    }

    fn goaway(&self, code: u32, out: &mut Vec<u8>) {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.last_stream.to_be_bytes());
        payload[4..].copy_from_slice(&code.to_be_bytes());
        frame(GOAWAY, 0, 0, &payload, out);
    }
}
