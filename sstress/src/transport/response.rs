//! Incremental HTTP/1.1 response parser.
//!
//! Bytes are fed as they arrive; the parser emits the head once, then body
//! chunk lengths, then a single `End`. Bodies are framed by
//! `Content-Length`, chunked transfer coding, or connection close. Body bytes
//! are counted, never stored.

use thiserror::Error;

/// Largest response head accepted before giving up.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("malformed status line")]
    StatusLine,

    #[error("malformed header line")]
    Header,

    #[error("malformed chunk framing")]
    Chunk,

    #[error("response head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Head(ResponseHead),
    /// `n` body bytes arrived.
    Body(usize),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    Chunked(Chunk),
    UntilClose,
    Done,
}

#[derive(Debug)]
pub struct ResponseParser {
    buf: Vec<u8>,
    state: State,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: State::Head,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes `data`, appending whatever events it completes to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed framing; the parser is then unusable.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<ResponseEvent>) -> Result<(), ResponseError> {
        self.buf.extend_from_slice(data);
        while self.step(out)? {}
        Ok(())
    }

    /// Signals that the peer closed the connection.
    ///
    /// Returns whether the response was complete.
    pub fn finish(&mut self, out: &mut Vec<ResponseEvent>) -> bool {
        match self.state {
            State::UntilClose => {
                self.state = State::Done;
                out.push(ResponseEvent::End);
                true
            }
            State::Done => true,
            _ => false,
        }
    }

    /// Runs one state transition; `false` means more input is needed.
    fn step(&mut self, out: &mut Vec<ResponseEvent>) -> Result<bool, ResponseError> {
        match self.state {
            State::Head => {
                let Some(end) = find(&self.buf, b"\r\n\r\n") else {
                    if self.buf.len() > MAX_HEAD_LEN {
                        return Err(ResponseError::HeadTooLarge);
                    }
                    return Ok(false);
                };
                let head = parse_head(&self.buf[..end])?;
                self.buf.drain(..end + 4);
                // Interim responses carry no body; the real head follows.
                if (100..200).contains(&head.status) {
                    return Ok(true);
                }
                self.state = body_framing(&head)?;
                out.push(ResponseEvent::Head(head));
                if let State::Length(0) = self.state {
                    self.end(out);
                }
                Ok(true)
            }
            State::Length(remaining) => {
                let n = self.take_body(remaining, out);
                if n == remaining {
                    self.end(out);
                    return Ok(true);
                }
                self.state = State::Length(remaining - n);
                Ok(false)
            }
            State::UntilClose => {
                if !self.buf.is_empty() {
                    out.push(ResponseEvent::Body(self.buf.len()));
                    self.buf.clear();
                }
                Ok(false)
            }
            State::Chunked(Chunk::Size) => {
                let Some(line) = self.take_line() else {
                    return Ok(false);
                };
                let digits = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(digits, 16).map_err(|_| ResponseError::Chunk)?;
                self.state = State::Chunked(if size == 0 {
                    Chunk::Trailer
                } else {
                    Chunk::Data(size)
                });
                Ok(true)
            }
            State::Chunked(Chunk::Data(remaining)) => {
                let n = self.take_body(remaining, out);
                if n == remaining {
                    self.state = State::Chunked(Chunk::DataEnd);
                    return Ok(true);
                }
                self.state = State::Chunked(Chunk::Data(remaining - n));
                Ok(false)
            }
            State::Chunked(Chunk::DataEnd) => {
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(ResponseError::Chunk);
                }
                self.buf.drain(..2);
                self.state = State::Chunked(Chunk::Size);
                Ok(true)
            }
            State::Chunked(Chunk::Trailer) => {
                let Some(line) = self.take_line() else {
                    return Ok(false);
                };
                if line.is_empty() {
                    self.end(out);
                }
                Ok(true)
            }
            State::Done => {
                self.buf.clear();
                Ok(false)
            }
        }
    }

    fn end(&mut self, out: &mut Vec<ResponseEvent>) {
        self.state = State::Done;
        out.push(ResponseEvent::End);
    }

    /// Counts up to `limit` buffered body bytes and drops them.
    fn take_body(&mut self, limit: u64, out: &mut Vec<ResponseEvent>) -> u64 {
        let n = usize::try_from(limit).map_or(self.buf.len(), |l| l.min(self.buf.len()));
        if n > 0 {
            self.buf.drain(..n);
            out.push(ResponseEvent::Body(n));
        }
        n as u64
    }

    fn take_line(&mut self) -> Option<String> {
        let end = find(&self.buf, b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..end + 2);
        Some(line)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, ResponseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ResponseError::Header)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(ResponseError::StatusLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(ResponseError::StatusLine);
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..600).contains(s))
        .ok_or(ResponseError::StatusLine)?;

    let headers = lines
        .map(|line| {
            line.split_once(':')
                .map(|(n, v)| (n.trim().to_owned(), v.trim().to_owned()))
                .ok_or(ResponseError::Header)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResponseHead { status, headers })
}

fn body_framing(head: &ResponseHead) -> Result<State, ResponseError> {
    if head.status == 204 || head.status == 304 {
        return Ok(State::Length(0));
    }
    if head
        .header("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(State::Chunked(Chunk::Size));
    }
    match head.header("content-length") {
        Some(len) => len
            .parse::<u64>()
            .map(State::Length)
            .map_err(|_| ResponseError::Header),
        None => Ok(State::UntilClose),
    }
}
