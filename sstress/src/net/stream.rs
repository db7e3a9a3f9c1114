//! Non-blocking TCP stream wrapper for mio-based I/O.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

use super::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Pending,
    Connected,
}

/// A non-blocking TCP client stream.
///
/// `connect` returns immediately; register the stream for writable
/// readiness and call [`TcpStream::connect_status`] when it fires.
#[derive(Debug)]
pub struct TcpStream {
    inner: MioTcpStream,
}

impl TcpStream {
    /// Starts a non-blocking connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or the connect is
    /// refused synchronously.
    pub fn connect(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpStream::connect(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Checks whether an in-progress connect has finished.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the connect failed.
    pub fn connect_status(&self) -> io::Result<ConnectStatus> {
        if let Some(e) = self.inner.take_error()? {
            return Err(e);
        }
        match self.inner.peer_addr() {
            Ok(_) => Ok(ConnectStatus::Connected),
            Err(e)
                if e.kind() == ErrorKind::NotConnected
                    || e.raw_os_error() == Some(rustix::io::Errno::INPROGRESS.raw_os_error()) =>
            {
                Ok(ConnectStatus::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any other I/O error.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
        match self.inner.write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Some(0)),
            Err(e) => Err(e),
        }
    }

    /// Reads, returning `Ok(None)` instead of `WouldBlock`; `Some(0)` is EOF.
    ///
    /// # Errors
    ///
    /// Returns any other I/O error.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio does not expose socket options; go through rustix.
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl AsFd for TcpStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn wait_connected(poll: &mut Poll, stream: &TcpStream) {
        let mut events = Events::with_capacity(4);
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(20)))
                .unwrap();
            if stream.connect_status().unwrap() == ConnectStatus::Connected {
                return;
            }
        }
        panic!("connect did not finish");
    }

    #[test]
    fn connect_write_and_read_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut poll = Poll::new().unwrap();
        let mut stream = TcpStream::connect(Endpoint::localhost(port)).unwrap();
        poll.registry()
            .register(&mut stream, Token(1), Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        wait_connected(&mut poll, &stream);

        assert_eq!(stream.try_write(b"hello").unwrap(), Some(5));
        server.join().unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < 5 && Instant::now() < deadline {
            match stream.try_read(&mut buf).unwrap() {
                Some(0) => break,
                Some(n) => got.extend_from_slice(&buf[..n]),
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(got, b"hello");
    }

    #[test]
    fn recv_buffer_size_can_grow() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpStream::connect(Endpoint::localhost(port)).unwrap();
        let before = stream.recv_buffer_size().unwrap();
        assert!(before > 0);
        stream.set_recv_buffer_size(before * 2).unwrap();
        assert!(stream.recv_buffer_size().unwrap() >= before);
    }
}
