//! DTLS 1.2 client connection (RFC 6347) carrying exactly one cipher
//! suite, `TLS_PSK_WITH_AES_128_CCM_8`.
//!
//! [`Dtls`] owns the UDP socket, runs the PSK handshake on connect and
//! afterwards exposes the decrypted application-data stream through the
//! [`Transport`] trait, which is what the CoAP channel consumes.

pub(crate) mod crypto;
mod handshake;

use std::net::UdpSocket;
use std::time::Duration;

use parking_lot::Mutex;

use crate::transport::Transport;
use crate::{Error, Result};

use crypto::{DTLS_VERSION, IV_LEN, KEY_LEN};
use handshake::HandshakeState;

// Record content types (RFC 5246 A.1; unchanged in DTLS).
pub(crate) const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub(crate) const CONTENT_HANDSHAKE: u8 = 22;
pub(crate) const CONTENT_APPLICATION_DATA: u8 = 23;

const RECORD_HEADER_LEN: usize = 13;
const READ_BUFFER: usize = 1500;

/// TLS_PSK_WITH_AES_128_CCM_8 (RFC 6655), the mandatory LwM2M PSK suite.
pub(crate) const CIPHER_SUITE: u16 = 0xc0a8;
/// Null compression.
pub(crate) const COMPRESSION: u8 = 0x00;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// One parsed record.
pub(crate) struct Record {
    pub content_type: u8,
    pub epoch: u16,
    pub sequence: u64,
    pub content: Vec<u8>,
}

/// Per-direction connection state; the handshake sub-state is dropped
/// (and wiped) once the connection is established.
pub(crate) struct ConnState {
    pub client_epoch: u16,
    pub client_sequence: u64,
    pub server_epoch: u16,
    pub server_sequence: u64,
    pub client_write_key: [u8; KEY_LEN],
    pub server_write_key: [u8; KEY_LEN],
    pub client_iv: [u8; IV_LEN],
    pub server_iv: [u8; IV_LEN],
    pub client_encrypt: bool,
    pub server_encrypt: bool,
    pub handshake: Option<HandshakeState>,
}

impl ConnState {
    fn new(identity: &[u8], psk: &[u8]) -> ConnState {
        ConnState {
            client_epoch: 0,
            client_sequence: 0,
            server_epoch: 0,
            server_sequence: 0,
            client_write_key: [0; KEY_LEN],
            server_write_key: [0; KEY_LEN],
            client_iv: [0; IV_LEN],
            server_iv: [0; IV_LEN],
            client_encrypt: false,
            server_encrypt: false,
            handshake: Some(HandshakeState::new(identity, psk)),
        }
    }
}

/// A DTLS 1.2 client connection.
pub struct Dtls {
    io: Box<dyn Transport>,
    pub(crate) state: Mutex<ConnState>,
}

impl Dtls {
    /// Dials `host` over UDP and completes the PSK handshake within five
    /// seconds. The socket is dropped on any failure.
    pub fn connect(host: &str, identity: &[u8], psk: &[u8]) -> Result<Dtls> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(Error::Transport)?;
        socket.connect(host).map_err(Error::Transport)?;
        Dtls::establish(Box::new(socket), identity, psk)
    }

    /// Runs the handshake over an already-connected datagram transport.
    pub(crate) fn establish(
        io: Box<dyn Transport>,
        identity: &[u8],
        psk: &[u8],
    ) -> Result<Dtls> {
        let dtls = Dtls {
            io,
            state: Mutex::new(ConnState::new(identity, psk)),
        };
        dtls.handshake(HANDSHAKE_TIMEOUT)?;
        Ok(dtls)
    }

    /// Sends one record, protecting it once the client side has switched
    /// to encryption. Increments the client sequence number.
    pub(crate) fn send_record(
        &self,
        content_type: u8,
        plain: &[u8],
    ) -> Result<()> {
        let record = {
            let mut state = self.state.lock();
            let content = if state.client_encrypt {
                crypto::seal(
                    &state.client_write_key,
                    &state.client_iv,
                    state.client_epoch,
                    state.client_sequence,
                    content_type,
                    plain,
                )?
            } else {
                plain.to_vec()
            };
            let record = build_record(
                content_type,
                state.client_epoch,
                state.client_sequence,
                &content,
            );
            state.client_sequence += 1;
            record
        };
        self.io.send(&record)?;
        Ok(())
    }

    /// Reads one datagram and parses every record in it, decrypting once
    /// the server side has switched to encryption.
    pub(crate) fn read_records(&self) -> Result<Vec<Record>> {
        let mut buf = [0u8; READ_BUFFER];
        let len = self.io.recv(&mut buf)?;
        self.parse_records(&buf[..len])
    }

    fn parse_records(&self, raw: &[u8]) -> Result<Vec<Record>> {
        let mut state = self.state.lock();
        let mut records = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            if rest.len() < RECORD_HEADER_LEN {
                return Err(Error::Protocol("short DTLS record".to_string()));
            }
            let content_type = rest[0];
            let epoch = u16::from_be_bytes([rest[3], rest[4]]);
            let sequence = u64::from_be_bytes([
                0, 0, rest[5], rest[6], rest[7], rest[8], rest[9], rest[10],
            ]);
            let length = u16::from_be_bytes([rest[11], rest[12]]) as usize;
            if rest.len() < RECORD_HEADER_LEN + length {
                return Err(Error::Protocol(
                    "truncated DTLS record".to_string(),
                ));
            }
            let body = &rest[RECORD_HEADER_LEN..RECORD_HEADER_LEN + length];
            rest = &rest[RECORD_HEADER_LEN + length..];

            // Monotonicity is recorded but not enforced.
            state.server_epoch = epoch;
            state.server_sequence = sequence;

            let content = if state.server_encrypt {
                crypto::open(
                    &state.server_write_key,
                    &state.server_iv,
                    content_type,
                    body,
                )?
            } else {
                body.to_vec()
            };

            if content_type == CONTENT_CHANGE_CIPHER_SPEC {
                state.server_encrypt = true;
            }

            records.push(Record {
                content_type,
                epoch,
                sequence,
                content,
            });
        }
        Ok(records)
    }
}

impl Transport for Dtls {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_record(CONTENT_APPLICATION_DATA, buf)?;
        Ok(buf.len())
    }

    /// Returns the next application-data fragment. Records that fail
    /// verification or parsing are dropped (RFC 6347 §4.1.2.1 for bad
    /// MACs); other record types at steady state are ignored.
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let records = match self.read_records() {
                Ok(records) => records,
                Err(Error::Decrypt) => {
                    log::warn!("dropping DTLS record with bad MAC");
                    continue;
                }
                Err(Error::Protocol(reason)) => {
                    log::warn!("dropping malformed DTLS datagram: {}", reason);
                    continue;
                }
                Err(err) => return Err(err),
            };
            for record in records {
                if record.content_type != CONTENT_APPLICATION_DATA {
                    continue;
                }
                let len = record.content.len().min(buf.len());
                buf[..len].copy_from_slice(&record.content[..len]);
                return Ok(len);
            }
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.io.set_read_timeout(timeout)
    }
}

/// Frames one record: 13-byte header, then the (possibly protected) body.
pub(crate) fn build_record(
    content_type: u8,
    epoch: u16,
    sequence: u64,
    content: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + content.len());
    out.push(content_type);
    out.extend_from_slice(&DTLS_VERSION.to_be_bytes());
    out.extend_from_slice(&epoch.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes()[2..]);
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.extend_from_slice(content);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_framing() {
        let record = build_record(23, 1, 0x0000_0000_0002, b"hello");
        assert_eq!(
            vec![
                23, 0xFE, 0xFD, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x02, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'
            ],
            record
        );
    }

    #[test]
    fn parse_splits_coalesced_records() {
        let dtls = Dtls {
            io: Box::new(loopback()),
            state: Mutex::new(ConnState::new(b"id", b"psk")),
        };
        let mut raw = build_record(22, 0, 1, b"one");
        raw.extend_from_slice(&build_record(22, 0, 2, b"two"));
        let records = dtls.parse_records(&raw).unwrap();
        assert_eq!(2, records.len());
        assert_eq!(b"one".to_vec(), records[0].content);
        assert_eq!(b"two".to_vec(), records[1].content);
        assert_eq!(2, records[1].sequence);
    }

    #[test]
    fn parse_rejects_truncation() {
        let dtls = Dtls {
            io: Box::new(loopback()),
            state: Mutex::new(ConnState::new(b"id", b"psk")),
        };
        let raw = build_record(22, 0, 1, b"payload");
        assert!(dtls.parse_records(&raw[..5]).is_err());
        assert!(dtls.parse_records(&raw[..raw.len() - 1]).is_err());
    }

    fn loopback() -> crate::transport::pipe::PipeEnd {
        crate::transport::pipe::pair().0
    }
}
