//! DAP wire framing: `Content-Length: N\r\n\r\n` followed by N bytes of
//! UTF-8 JSON. The decoder consumes an append-only byte buffer and yields
//! whole frames, surviving partial reads and malformed headers.

use crate::dap::types::Message;
use crate::{Error, Result};
use tracing::warn;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Incremental frame decoder over an owned byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the wire.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame body, if one is buffered.
    ///
    /// A header with a missing, non-numeric, or non-positive
    /// `Content-Length` is discarded together with the bytes of the frame it
    /// described; scanning then resumes at the next header candidate.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let header_end = find_subsequence(&self.buf, HEADER_TERMINATOR)?;
            let header = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
            let body_start = header_end + HEADER_TERMINATOR.len();

            match parse_content_length(&header) {
                Some(len) => {
                    if self.buf.len() < body_start + len {
                        return None;
                    }
                    let body = self.buf[body_start..body_start + len].to_vec();
                    self.buf.drain(..body_start + len);
                    return Some(body);
                }
                None => {
                    warn!(
                        "Discarding DAP frame with invalid header: {:?}",
                        header.trim()
                    );
                    self.buf.drain(..body_start);
                    self.resync();
                }
            }
        }
    }

    /// Decode the next complete frame as a DAP message.
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        let frame = self.next_frame()?;
        Some(
            serde_json::from_slice(&frame)
                .map_err(|e| Error::Dap(format!("Failed to parse DAP message: {}", e))),
        )
    }

    /// Drop body bytes of an abandoned frame: skip ahead to the next
    /// plausible header so scanning does not treat payload as headers.
    fn resync(&mut self) {
        let lower: Vec<u8> = self.buf.iter().map(|b| b.to_ascii_lowercase()).collect();
        match find_subsequence(&lower, CONTENT_LENGTH.as_bytes()) {
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => self.buf.clear(),
        }
    }
}

/// Assemble one outbound frame: header and body in a single buffer so the
/// transport can issue a single write.
pub fn encode_frame(json: &str) -> Vec<u8> {
    let body = json.as_bytes();
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body);
    frame
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_string(msg)
        .map_err(|e| Error::Dap(format!("Failed to serialize DAP message: {}", e)))?;
    Ok(encode_frame(&json))
}

fn parse_content_length(header: &str) -> Option<usize> {
    for line in header.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            return match value.trim().parse::<usize>() {
                Ok(len) if len > 0 => Some(len),
                _ => None,
            };
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
