//! Plain HTTP/1.1 service for port 80 and for sessions that negotiated
//! `http/1.1` (or nothing) via ALPN: one fixed response, then close.

use log::info;

use crate::err::Fatal;

pub const RESPONSE_BODY: &str = "Hello from User-Space HTTP/1.1!";

const MAX_REQUEST_HEADER: usize = 16 * 1024;

pub struct Http1 {
    buf: Vec<u8>,
    responded: bool,
}

impl Http1 {
    pub fn new() -> Self {
        Http1 {
            buf: Vec::new(),
            responded: false,
        }
    }

    /// Buffers request bytes until the header block is complete, then
    /// emits the canned response. Returns true once the transport should
    /// close. Request contents beyond the request line are ignored.
    pub fn ingest(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<bool, Fatal> {
        if self.responded {
            return Ok(false);
        }

        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_REQUEST_HEADER {
            return Err(Fatal::Http1("request header block too large"));
        }

        if !self.buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(false);
        }

        let request_line = self
            .buf
            .split(|&b| b == b'\r')
            .next()
            .map(String::from_utf8_lossy)
            .unwrap_or_default()
            .into_owned();
        info!("http: {}", request_line);

        out.extend_from_slice(
            format!(
                "HTTP/1.1 200 OK\r\n\
                 content-type: text/plain\r\n\
                 content-length: {}\r\n\
                 connection: close\r\n\
                 \r\n",
                RESPONSE_BODY.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(RESPONSE_BODY.as_bytes());

        self.responded = true;
        Ok(true)
    }
}
