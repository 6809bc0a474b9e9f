//! Datagram transports the protocol layers run on.
//!
//! The CoAP channel is transport-agnostic: it runs over a DTLS connection
//! for device management and over a plain UDP socket for bootstrap. Both
//! sides of that seam implement [`Transport`].

use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use crate::{Error, Result};

/// A connected datagram endpoint.
///
/// `recv` honours the configured read timeout by failing with an error
/// whose kind is `WouldBlock` or `TimedOut`; [`is_timeout`] classifies it.
pub trait Transport: Send + Sync {
    /// Sends one datagram.
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Receives one datagram into `buf`, returning its length.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Bounds how long `recv` may block; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;
}

impl Transport for UdpSocket {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        UdpSocket::send(self, buf).map_err(Error::Transport)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        UdpSocket::recv(self, buf).map_err(Error::Transport)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        UdpSocket::set_read_timeout(self, timeout).map_err(Error::Transport)
    }
}

/// True when `err` is a read-timeout expiry rather than a transport fault.
pub fn is_timeout(err: &Error) -> bool {
    matches!(
        err,
        Error::Transport(e) if matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    )
}

#[cfg(test)]
pub(crate) mod pipe {
    //! An in-memory datagram pair for protocol tests.

    use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
    use parking_lot::Mutex;

    use super::*;

    pub struct PipeEnd {
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
        timeout: Mutex<Option<Duration>>,
    }

    /// Two connected endpoints; datagrams written to one side are read
    /// from the other, in order and without loss.
    pub fn pair() -> (PipeEnd, PipeEnd) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            PipeEnd {
                tx: a_tx,
                rx: b_rx,
                timeout: Mutex::new(None),
            },
            PipeEnd {
                tx: b_tx,
                rx: a_rx,
                timeout: Mutex::new(None),
            },
        )
    }

    impl PipeEnd {
        /// Test-side convenience: next datagram or `None` on timeout.
        pub fn take_datagram(&self, timeout: Duration) -> Option<Vec<u8>> {
            self.rx.recv_timeout(timeout).ok()
        }

        /// Test-side convenience: inject a datagram.
        pub fn push_datagram(&self, datagram: Vec<u8>) {
            let _ = self.tx.send(datagram);
        }
    }

    impl Transport for PipeEnd {
        fn send(&self, buf: &[u8]) -> Result<usize> {
            self.tx.send(buf.to_vec()).map_err(|_| {
                Error::Transport(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe closed",
                ))
            })?;
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            let timeout = *self.timeout.lock();
            let datagram = match timeout {
                Some(timeout) => {
                    self.rx.recv_timeout(timeout).map_err(|e| match e {
                        RecvTimeoutError::Timeout => Error::Transport(
                            io::Error::new(io::ErrorKind::TimedOut, "recv"),
                        ),
                        RecvTimeoutError::Disconnected => Error::Transport(
                            io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "pipe closed",
                            ),
                        ),
                    })?
                }
                None => self.rx.recv().map_err(|_| {
                    Error::Transport(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe closed",
                    ))
                })?,
            };
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            Ok(len)
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
            *self.timeout.lock() = timeout;
            Ok(())
        }
    }
}
