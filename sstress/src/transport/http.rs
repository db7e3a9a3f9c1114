//! HTTP/1.1 over plain TCP, driven by the instance's mio poll.
//!
//! One connection per stream, `Connection: close`. Every try reports
//! `Connecting` first and opens its socket on the following tick, so
//! metadata attached in reaction to `Connecting` is part of the request.
//! Host names are resolved off the loop thread; literal addresses are used
//! as they are.
//!
//! Connect and lookup failures are retried per the stream's retry policy
//! with jittered backoff, driven by `on_tick`; once the policy is out of
//! retries the stream reports `RetriesExhausted`. A complete response yields
//! the body as data chunks, end-of-message, an ack whose polarity is decided
//! by the policy's expected status, then `Disconnected`.

use std::collections::{HashMap, VecDeque};
use std::io;

use mio::event::Event;
use mio::{Interest, Registry, Token};

use super::response::{ResponseEvent, ResponseParser};
use super::{CreationError, Signal, StreamEvent, StreamId, StreamRequest, Transport, TransportError};
use crate::net::{ConnectStatus, Endpoint, Resolver, TcpStream};
use crate::runtime::timing::{Duration, Millis, Timestamp};
use crate::trace::{debug, warn};

/// Streams one transport keeps open at once.
pub const DEFAULT_MAX_STREAMS: usize = 128;

const READ_CHUNK: usize = 16 * 1024;
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Wakes the poll when a lookup finishes. Stream tokens never get this high.
const RESOLVER_TOKEN: Token = Token(usize::MAX - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    /// `Connecting` reported; the socket opens on the next tick.
    Pending { since: Timestamp<Millis> },
    Resolving,
    Backoff { until: Timestamp<Millis> },
    Connecting,
    Sending,
    Receiving,
    Closed,
}

#[derive(Debug)]
struct Conn {
    request: StreamRequest,
    phase: Phase,
    socket: Option<TcpStream>,
    retries: u16,
    metadata: Vec<(String, String)>,
    out: Vec<u8>,
    written: usize,
    parser: ResponseParser,
    status: Option<u16>,
}

impl Conn {
    fn new(request: StreamRequest) -> Self {
        Self {
            request,
            phase: Phase::Created,
            socket: None,
            retries: 0,
            metadata: Vec::new(),
            out: Vec::new(),
            written: 0,
            parser: ResponseParser::new(),
            status: None,
        }
    }

    /// Serializes the request once the connection is up.
    fn build_request(&mut self) {
        let policy = &self.request.policy;
        let mut path = policy.expand_url(&self.metadata);
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let mut req = format!(
            "{} {path} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\n",
            policy.http_method, policy.endpoint, self.request.user_agent
        );
        for (name, value) in &self.metadata {
            if let Some(header) = policy.header_for(name) {
                req.push_str(header.trim_end_matches(':'));
                req.push_str(": ");
                req.push_str(value);
                req.push_str("\r\n");
            }
        }
        if policy.use_auth
            && let Some(token) = &self.request.credential
        {
            req.push_str("Authorization: Bearer ");
            req.push_str(token);
            req.push_str("\r\n");
        }
        req.push_str("Connection: close\r\n\r\n");
        self.out = req.into_bytes();
        self.written = 0;
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    registry: Option<Registry>,
    resolver: Option<Resolver<StreamId>>,
    conns: HashMap<StreamId, Conn>,
    queue: VecDeque<StreamEvent>,
    read_buf: Vec<u8>,
    max_streams: usize,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_streams(DEFAULT_MAX_STREAMS)
    }

    #[must_use]
    pub fn with_max_streams(max_streams: usize) -> Self {
        Self {
            registry: None,
            resolver: None,
            conns: HashMap::new(),
            queue: VecDeque::new(),
            read_buf: vec![0; READ_CHUNK],
            max_streams,
        }
    }

    fn emit(&mut self, id: StreamId, signal: Signal) {
        self.queue.push_back(StreamEvent::new(id, signal));
    }

    fn open_socket(&self, id: StreamId, endpoint: Endpoint) -> io::Result<TcpStream> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| io::Error::other("transport not attached to a poll"))?;
        let mut socket = TcpStream::connect(endpoint)?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            debug!(stream = %id, error = %e, "cannot size receive buffer");
        }
        registry.register(&mut socket, id.token(), Interest::READABLE | Interest::WRITABLE)?;
        Ok(socket)
    }

    /// Reports `Connecting`; the try itself starts on the next tick.
    fn announce_try(&mut self, id: StreamId, now: Timestamp<Millis>) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.phase = Phase::Pending { since: now };
            self.emit(id, Signal::Connecting);
        }
    }

    /// Opens the socket, looking the host up first unless it is an address.
    fn begin_connect(&mut self, id: StreamId, now: Timestamp<Millis>) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let policy = &conn.request.policy;
        if let Some(endpoint) = Endpoint::literal(&policy.endpoint, policy.port) {
            self.open(id, endpoint, now);
            return;
        }
        let looked_up = match self.resolver.as_ref() {
            Some(resolver) => resolver.lookup(id, &policy.endpoint, policy.port),
            None => Err(io::Error::other("transport not attached to a poll")),
        };
        match looked_up {
            Ok(()) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    debug!(stream = %id, host = %conn.request.policy.endpoint, "resolving");
                    conn.phase = Phase::Resolving;
                }
            }
            Err(e) => {
                warn!(stream = %id, error = %e, "cannot start lookup");
                self.connect_failed(id, now);
            }
        }
    }

    fn open(&mut self, id: StreamId, endpoint: Endpoint, now: Timestamp<Millis>) {
        match self.open_socket(id, endpoint) {
            Ok(socket) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.socket = Some(socket);
                    conn.phase = Phase::Connecting;
                }
                // A loopback connect may already be complete.
                self.drive(id, now);
            }
            Err(e) => {
                warn!(stream = %id, %endpoint, error = %e, "connect failed");
                self.connect_failed(id, now);
            }
        }
    }

    /// Picks up finished lookups for streams still waiting on them.
    fn on_resolved(&mut self, now: Timestamp<Millis>) {
        loop {
            let Some((id, answer)) = self.resolver.as_ref().and_then(Resolver::try_recv) else {
                break;
            };
            let waiting = self
                .conns
                .get(&id)
                .is_some_and(|c| c.phase == Phase::Resolving);
            if !waiting {
                debug!(stream = %id, "dropping stale lookup");
                continue;
            }
            match answer {
                Ok(endpoint) => {
                    debug!(stream = %id, %endpoint, "resolved");
                    self.open(id, endpoint, now);
                }
                Err(e) => {
                    warn!(stream = %id, error = %e, "lookup failed");
                    self.connect_failed(id, now);
                }
            }
        }
    }

    fn close_socket(&mut self, id: StreamId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if let (Some(mut socket), Some(registry)) = (conn.socket.take(), self.registry.as_ref())
            && let Err(e) = registry.deregister(&mut socket)
        {
            debug!(stream = %id, error = %e, "deregister failed");
        }
    }

    /// Backs off for another try, or gives up once the retry policy is spent.
    fn connect_failed(&mut self, id: StreamId, now: Timestamp<Millis>) {
        self.close_socket(id);
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.request.retry.allows_retry(conn.retries) {
            let delay = conn
                .request
                .retry
                .backoff_ms(conn.retries, &mut rand::thread_rng());
            conn.retries += 1;
            conn.phase = Phase::Backoff {
                until: now + Duration::from_millis(delay),
            };
            debug!(stream = %id, retry = conn.retries, delay_ms = delay, "connect retry scheduled");
        } else {
            conn.phase = Phase::Closed;
            self.emit(id, Signal::RetriesExhausted);
        }
    }

    /// Ends the connection after a transfer, reporting the disconnect.
    fn disconnect(&mut self, id: StreamId) {
        self.close_socket(id);
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.phase = Phase::Closed;
        }
        self.emit(id, Signal::Disconnected);
    }

    /// Advances one stream as far as its socket allows.
    fn drive(&mut self, id: StreamId, now: Timestamp<Millis>) {
        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            match conn.phase {
                Phase::Connecting => {
                    let status = match conn.socket.as_ref() {
                        Some(socket) => socket.connect_status(),
                        None => return,
                    };
                    match status {
                        Ok(ConnectStatus::Connected) => {
                            conn.build_request();
                            conn.phase = Phase::Sending;
                            self.emit(id, Signal::Connected);
                        }
                        Ok(ConnectStatus::Pending) => return,
                        Err(e) => {
                            warn!(stream = %id, error = %e, "connect failed");
                            self.connect_failed(id, now);
                            return;
                        }
                    }
                }
                Phase::Sending => {
                    let Some(socket) = conn.socket.as_mut() else {
                        return;
                    };
                    match socket.try_write(&conn.out[conn.written..]) {
                        Ok(Some(n)) => {
                            conn.written += n;
                            if conn.written == conn.out.len() {
                                conn.phase = Phase::Receiving;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(stream = %id, error = %e, "request write failed");
                            self.disconnect(id);
                            return;
                        }
                    }
                }
                Phase::Receiving => {
                    self.receive(id);
                    return;
                }
                Phase::Created
                | Phase::Pending { .. }
                | Phase::Resolving
                | Phase::Backoff { .. }
                | Phase::Closed => return,
            }
        }
    }

    fn receive(&mut self, id: StreamId) {
        let mut parsed = Vec::new();
        let closed = loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            let Some(socket) = conn.socket.as_mut() else {
                return;
            };
            match socket.try_read(&mut self.read_buf) {
                Ok(Some(0)) => break true,
                Ok(Some(n)) => {
                    if let Err(e) = conn.parser.feed(&self.read_buf[..n], &mut parsed) {
                        warn!(stream = %id, error = %e, "bad response");
                        self.disconnect(id);
                        return;
                    }
                    if conn.parser.is_done() {
                        break false;
                    }
                }
                Ok(None) => break false,
                Err(e) => {
                    warn!(stream = %id, error = %e, "read failed");
                    break true;
                }
            }
        };

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if closed && !conn.parser.finish(&mut parsed) {
            debug!(stream = %id, "connection closed mid-response");
        }
        let mut complete = false;
        let mut signals = Vec::with_capacity(parsed.len() + 2);
        for event in parsed {
            match event {
                ResponseEvent::Head(head) => {
                    debug!(stream = %id, status = head.status, "response head");
                    conn.status = Some(head.status);
                }
                ResponseEvent::Body(len) => signals.push(Signal::Data { len, eom: false }),
                ResponseEvent::End => {
                    signals.push(Signal::Data { len: 0, eom: true });
                    let policy = &conn.request.policy;
                    let status = conn.status.unwrap_or_default();
                    let ack = if policy.is_success(status) {
                        Signal::AckPositive
                    } else {
                        if policy.http_fail_redirect && (300..400).contains(&status) {
                            debug!(stream = %id, status, "redirect treated as failure");
                        }
                        Signal::AckNegative
                    };
                    signals.push(ack);
                    complete = true;
                }
            }
        }
        for signal in signals {
            self.emit(id, signal);
        }
        if complete || closed {
            self.disconnect(id);
        }
    }
}

impl Transport for HttpTransport {
    fn attach(&mut self, registry: &Registry) -> io::Result<()> {
        self.registry = Some(registry.try_clone()?);
        self.resolver = Some(Resolver::new(registry, RESOLVER_TOKEN)?);
        Ok(())
    }

    fn create(&mut self, id: StreamId, request: StreamRequest) -> Result<(), CreationError> {
        if request.policy.tls {
            return Err(CreationError::Unsupported {
                stream: request.stream_type,
                feature: "tls".to_owned(),
            });
        }
        if request.policy.protocol != "h1" {
            return Err(CreationError::Unsupported {
                feature: format!("protocol {}", request.policy.protocol),
                stream: request.stream_type,
            });
        }
        if self.conns.len() >= self.max_streams {
            return Err(CreationError::ResourceExhausted(format!(
                "{} streams already open",
                self.conns.len()
            )));
        }
        self.conns.insert(id, Conn::new(request));
        Ok(())
    }

    fn connect(&mut self, id: StreamId, now: Timestamp<Millis>) -> Result<(), CreationError> {
        if self.registry.is_none() {
            return Err(CreationError::ResourceExhausted(
                "transport not attached to a poll".to_owned(),
            ));
        }
        match self.conns.get(&id).map(|c| c.phase) {
            Some(Phase::Created) => {
                self.announce_try(id, now);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(CreationError::ResourceExhausted(format!(
                "connect on unknown stream {id}"
            ))),
        }
    }

    fn set_metadata(
        &mut self,
        id: StreamId,
        name: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or(TransportError::UnknownStream(id))?;
        if conn.request.policy.header_for(name).is_none() {
            return Err(TransportError::MetadataRejected {
                stream: id,
                name: name.to_owned(),
            });
        }
        match conn.metadata.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => value.clone_into(&mut entry.1),
            None => conn.metadata.push((name.to_owned(), value.to_owned())),
        }
        Ok(())
    }

    fn teardown(&mut self, id: StreamId) {
        self.close_socket(id);
        self.conns.remove(&id);
        self.queue.retain(|e| e.stream != id);
    }

    fn on_ready(&mut self, event: &Event, now: Timestamp<Millis>) {
        if event.token() == RESOLVER_TOKEN {
            self.on_resolved(now);
        } else {
            self.drive(StreamId::from_token(event.token()), now);
        }
    }

    fn on_tick(&mut self, now: Timestamp<Millis>) {
        let mut pending = Vec::new();
        let mut retrying = Vec::new();
        for (id, conn) in &self.conns {
            match conn.phase {
                Phase::Pending { .. } => pending.push(*id),
                Phase::Backoff { until } if until <= now => retrying.push(*id),
                _ => {}
            }
        }
        for id in pending {
            self.begin_connect(id, now);
        }
        for id in retrying {
            self.announce_try(id, now);
        }
    }

    fn next_wakeup(&self) -> Option<Timestamp<Millis>> {
        self.conns
            .values()
            .filter_map(|c| match c.phase {
                Phase::Pending { since } => Some(since),
                Phase::Backoff { until } => Some(until),
                _ => None,
            })
            .min()
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use crate::runtime::timing::{Clock, MonotonicClock};
    use mio::{Events, Poll};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Instant;

    fn policy_for(port: u16, extra: &str) -> Policy {
        policy_at("127.0.0.1", port, extra)
    }

    fn policy_at(host: &str, port: u16, extra: &str) -> Policy {
        Policy::parse(&format!(
            r#"{{
                "release": "t", "product": "t", "schema-version": 1,
                "retry": [{{"quick": {{"backoff": [5, 5], "conceal": 2, "jitterpc": 0}}}}],
                "s": [{{"probe": {{
                    "endpoint": "{host}", "port": {port}, "protocol": "h1",
                    "http_method": "GET", "http_url": "up/${{uptag}}",
                    "metadata": [{{"uptag": "X-Upload-Tag:"}}],
                    "retry": "quick", "http_expect": 200 {extra}
                }}}}]
            }}"#
        ))
        .unwrap()
    }

    fn request(policy: &Policy) -> StreamRequest {
        let stream = policy.stream("probe").unwrap().clone();
        StreamRequest {
            stream_type: "probe".to_owned(),
            retry: policy.retry_for(&stream),
            policy: stream,
            user_agent: "sstress-test".to_owned(),
            credential: Some("tok".to_owned()),
        }
    }

    /// Serves one canned response and hands back the request it read.
    fn serve_once(response: &'static [u8]) -> (u16, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
            }
            conn.write_all(response).unwrap();
            tx.send(String::from_utf8_lossy(&req).into_owned()).unwrap();
        });
        (port, rx)
    }

    fn pump(transport: &mut HttpTransport, poll: &mut Poll, stop: Signal) -> Vec<Signal> {
        let clock = MonotonicClock::new();
        let mut events = Events::with_capacity(16);
        let mut seen = Vec::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while Instant::now() < deadline {
            while let Some(event) = transport.poll_event() {
                seen.push(event.signal);
            }
            if seen.contains(&stop) {
                break;
            }
            poll.poll(&mut events, Some(std::time::Duration::from_millis(5)))
                .unwrap();
            let now = clock.now();
            for event in &events {
                transport.on_ready(event, now);
            }
            transport.on_tick(now);
        }
        seen
    }

    fn attached() -> (HttpTransport, Poll) {
        let poll = Poll::new().unwrap();
        let mut transport = HttpTransport::new();
        transport.attach(poll.registry()).unwrap();
        (transport, poll)
    }

    #[test]
    fn expected_status_yields_positive_ack() {
        let (port, rx) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let policy = policy_for(port, r#", "use_auth": true"#);
        let (mut t, mut poll) = attached();
        let id = StreamId(1);
        t.create(id, request(&policy)).unwrap();
        t.connect(id, Timestamp::new(0)).unwrap();
        // Tags attached in reaction to `Connecting` still make the request.
        assert_eq!(t.poll_event().map(|e| e.signal), Some(Signal::Connecting));
        assert_eq!(t.next_wakeup(), Some(Timestamp::new(0)));
        t.set_metadata(id, "uptag", "myuptag123").unwrap();

        let seen = pump(&mut t, &mut poll, Signal::Disconnected);
        assert_eq!(seen.first(), Some(&Signal::Connected));
        let body: usize = seen
            .iter()
            .map(|s| match s {
                Signal::Data { len, .. } => *len,
                _ => 0,
            })
            .sum();
        assert_eq!(body, 5);
        assert!(seen.contains(&Signal::Data { len: 0, eom: true }));
        assert_eq!(
            &seen[seen.len() - 2..],
            &[Signal::AckPositive, Signal::Disconnected]
        );

        let req = rx.recv().unwrap();
        assert!(req.starts_with("GET /up/myuptag123 HTTP/1.1\r\n"));
        assert!(req.contains("X-Upload-Tag: myuptag123\r\n"));
        assert!(req.contains("Authorization: Bearer tok\r\n"));
        assert!(req.contains("User-Agent: sstress-test\r\n"));
    }

    #[test]
    fn host_names_are_resolved_before_connecting() {
        let (port, rx) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let policy = policy_at("localhost", port, "");
        let (mut t, mut poll) = attached();
        t.create(StreamId(5), request(&policy)).unwrap();
        t.connect(StreamId(5), Timestamp::new(0)).unwrap();

        let seen = pump(&mut t, &mut poll, Signal::Disconnected);
        assert!(seen.contains(&Signal::AckPositive));
        assert!(rx.recv().unwrap().contains("Host: localhost\r\n"));
    }

    #[test]
    fn unexpected_status_yields_negative_ack() {
        let (port, _rx) = serve_once(b"HTTP/1.1 302 Found\r\nLocation: /x\r\nContent-Length: 0\r\n\r\n");
        let policy = policy_for(port, r#", "http_fail_redirect": true"#);
        let (mut t, mut poll) = attached();
        t.create(StreamId(2), request(&policy)).unwrap();
        t.connect(StreamId(2), Timestamp::new(0)).unwrap();

        let seen = pump(&mut t, &mut poll, Signal::Disconnected);
        assert!(seen.contains(&Signal::AckNegative));
        assert!(!seen.contains(&Signal::AckPositive));
    }

    #[test]
    fn refused_connect_retries_then_exhausts() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let policy = policy_for(port, "");
        let (mut t, mut poll) = attached();
        t.create(StreamId(3), request(&policy)).unwrap();
        t.connect(StreamId(3), Timestamp::new(0)).unwrap();

        let seen = pump(&mut t, &mut poll, Signal::RetriesExhausted);
        let attempts = seen.iter().filter(|s| **s == Signal::Connecting).count();
        assert_eq!(attempts, 3);
        assert_eq!(seen.last(), Some(&Signal::RetriesExhausted));
        assert!(t.next_wakeup().is_none());
    }

    #[test]
    fn unsupported_and_rejected_requests() {
        let policy = policy_for(80, r#", "tls": true"#);
        let mut t = HttpTransport::new();
        assert!(matches!(
            t.create(StreamId(1), request(&policy)),
            Err(CreationError::Unsupported { .. })
        ));

        let policy = policy_for(80, "");
        t.create(StreamId(2), request(&policy)).unwrap();
        assert!(matches!(
            t.set_metadata(StreamId(2), "ctype", "x"),
            Err(TransportError::MetadataRejected { .. })
        ));
        assert!(matches!(
            t.set_metadata(StreamId(9), "uptag", "x"),
            Err(TransportError::UnknownStream(_))
        ));
        // Not attached to a poll yet.
        assert!(t.connect(StreamId(2), Timestamp::new(0)).is_err());
    }

    #[test]
    fn stream_limit_is_enforced() {
        let policy = policy_for(80, "");
        let mut t = HttpTransport::with_max_streams(1);
        t.create(StreamId(1), request(&policy)).unwrap();
        assert!(matches!(
            t.create(StreamId(2), request(&policy)),
            Err(CreationError::ResourceExhausted(_))
        ));
        t.teardown(StreamId(1));
        t.create(StreamId(2), request(&policy)).unwrap();
    }
}
