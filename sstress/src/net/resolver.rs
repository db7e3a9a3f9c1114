//! Host name lookups kept off the event loop.
//!
//! Every lookup runs on a short-lived helper thread. The answer comes back
//! over a channel and the poll is woken through a [`Waker`] registered under
//! the resolver's own token.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use mio::{Registry, Token, Waker};

use super::Endpoint;

type Answer<K> = (K, io::Result<Endpoint>);

#[derive(Debug)]
pub struct Resolver<K> {
    token: Token,
    waker: Arc<Waker>,
    tx: Sender<Answer<K>>,
    rx: Receiver<Answer<K>>,
}

impl<K: Send + 'static> Resolver<K> {
    /// # Errors
    ///
    /// Fails if the waker cannot be registered with the poll.
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        let waker = Arc::new(Waker::new(registry, token)?);
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            token,
            waker,
            tx,
            rx,
        })
    }

    /// Readiness events carrying this token mean answers are waiting.
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Starts resolving `host:port`; the answer is tagged with `key`.
    ///
    /// # Errors
    ///
    /// Fails if the helper thread cannot be started.
    pub fn lookup(&self, key: K, host: &str, port: u16) -> io::Result<()> {
        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);
        let host = host.to_owned();
        thread::Builder::new()
            .name("sstress-resolve".to_owned())
            .spawn(move || {
                let answer = Endpoint::resolve(&host, port);
                // The transport may be gone; nothing to report to then.
                if tx.send((key, answer)).is_ok() {
                    let _ = waker.wake();
                }
            })?;
        Ok(())
    }

    /// Next finished lookup, if any.
    pub fn try_recv(&self) -> Option<Answer<K>> {
        self.rx.try_recv().ok()
    }
}
