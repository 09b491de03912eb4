//! Line tokenizer that watches a relayed byte stream.
//!
//! One observer per direction. It keeps a private copy of the unterminated
//! tail of the stream and never touches the bytes being forwarded.
//!
//! # Bounds
//! The retained tail is capped at [`MAX_PENDING_LINE`]. A peer that never
//! sends a newline has its tail discarded up to the next newline; relaying
//! carries on untouched.

use serde_json::Value;

use crate::net::connection::Side;
use crate::protocol::message::Message;

/// Ceiling for an unterminated line before it is dropped.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Coarse classification of lines that are not JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Noise {
    /// Looks like an HTTP request or response line.
    ForeignHttp,
    /// Looks like a TLS record header.
    Tls,
    /// Not valid UTF-8.
    Binary,
    /// Text, but not JSON.
    Unknown,
}

impl Noise {
    fn classify(line: &[u8]) -> Self {
        const HTTP_PREFIXES: [&[u8]; 8] = [
            b"GET ", b"POST ", b"HEAD ", b"PUT ", b"DELETE ", b"OPTIONS ", b"CONNECT ", b"HTTP/",
        ];
        if line.len() >= 2 && line[0] == 0x16 && line[1] == 0x03 {
            return Noise::Tls;
        }
        if HTTP_PREFIXES.iter().any(|p| line.starts_with(p)) {
            return Noise::ForeignHttp;
        }
        if std::str::from_utf8(line).is_err() {
            return Noise::Binary;
        }
        Noise::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Noise::ForeignHttp => "foreign_http",
            Noise::Tls => "tls",
            Noise::Binary => "binary",
            Noise::Unknown => "unknown",
        }
    }
}

/// Something the observer extracted from a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Message(Message),
    /// First non-JSON line seen by this observer. Reported once.
    Noise(Noise),
}

/// Counters for what the observer has seen and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub messages: u64,
    pub malformed_lines: u64,
    /// Bytes dropped from the private buffer by the overflow policy.
    pub discarded_bytes: u64,
}

/// Per-direction protocol observer.
#[derive(Debug)]
pub struct ProtocolObserver {
    origin: Side,
    pending: Vec<u8>,
    /// Skipping the remainder of an oversized line.
    discarding: bool,
    noise_reported: bool,
    stats: ObserverStats,
}

impl ProtocolObserver {
    /// Observer for bytes arriving from `origin`.
    pub fn new(origin: Side) -> Self {
        Self {
            origin,
            pending: Vec::new(),
            discarding: false,
            noise_reported: false,
            stats: ObserverStats::default(),
        }
    }

    pub fn origin(&self) -> Side {
        self.origin
    }

    pub fn stats(&self) -> ObserverStats {
        self.stats
    }

    /// Bytes currently held waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one received chunk. Returns what completed lines decoded to.
    pub fn observe(&mut self, chunk: &[u8]) -> Vec<Observation> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.stats.discarded_bytes += head.len() as u64 + 1;
                continue;
            }

            if self.pending.is_empty() {
                self.handle_line(head, &mut out);
            } else {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(head);
                self.handle_line(&line, &mut out);
                line.clear();
                self.pending = line;
            }
        }

        if self.discarding {
            self.stats.discarded_bytes += rest.len() as u64;
            return out;
        }

        self.pending.extend_from_slice(rest);
        if self.pending.len() > MAX_PENDING_LINE {
            tracing::debug!(
                side = %self.origin,
                bytes = self.pending.len(),
                "Unterminated line exceeded buffer ceiling, discarding"
            );
            self.stats.discarded_bytes += self.pending.len() as u64;
            self.pending = Vec::new();
            self.discarding = true;
        }

        out
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<Observation>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(Value::Object(object)) => {
                self.stats.messages += 1;
                out.push(Observation::Message(Message::classify(object, self.origin)));
            }
            // Valid JSON, but not a message.
            Ok(_) => {}
            Err(_) => {
                self.stats.malformed_lines += 1;
                if !self.noise_reported {
                    self.noise_reported = true;
                    out.push(Observation::Noise(Noise::classify(line)));
                }
            }
        }
    }
}
