//! The DTLS 1.2 PSK handshake, client side.
//!
//! Lockstep and all-or-nothing: no retransmit, no reordering, no
//! fragmentation. Either the full exchange completes within the deadline
//! or the connection attempt fails.

use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::transport;
use crate::{Error, Result};

use super::crypto::{self, DTLS_VERSION};
use super::{
    Dtls, Record, CIPHER_SUITE, COMPRESSION, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE,
};

// Handshake message types (RFC 6347 §4.3.2).
const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const HELLO_VERIFY_REQUEST: u8 = 3;
const SERVER_HELLO_DONE: u8 = 14;
const CLIENT_KEY_EXCHANGE: u8 = 16;
const FINISHED: u8 = 20;

const CHANGE_CIPHER_SPEC_MESSAGE: u8 = 1;
const HEADER_LEN: usize = 12;
const VERIFY_DATA_LEN: usize = 12;

/// Mutable state of a handshake in progress. Wiped on drop.
pub(crate) struct HandshakeState {
    pub identity: Vec<u8>,
    pub pre_master: Vec<u8>,
    pub master: [u8; 48],
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub session: Vec<u8>,
    pub cookie: Vec<u8>,
    /// Concatenation of the hashable handshake messages. The initial
    /// ClientHello and the HelloVerifyRequest stay out (RFC 6347 §4.2.1).
    pub messages: Vec<u8>,
    pub client_sequence: u16,
    pub server_sequence: u16,
    pub hello_done: bool,
    pub finished_received: bool,
    pub verified: bool,
}

impl HandshakeState {
    pub fn new(identity: &[u8], psk: &[u8]) -> HandshakeState {
        HandshakeState {
            identity: identity.to_vec(),
            pre_master: crypto::pre_master_secret(psk),
            master: [0; 48],
            client_random: crypto::client_random(),
            server_random: [0; 32],
            session: Vec::new(),
            cookie: Vec::new(),
            messages: Vec::new(),
            client_sequence: 0,
            server_sequence: 0,
            hello_done: false,
            finished_received: false,
            verified: false,
        }
    }

    fn client_verify_data(&self) -> Vec<u8> {
        crypto::prf(
            &self.master,
            b"client finished",
            &crypto::transcript_hash(&self.messages),
            VERIFY_DATA_LEN,
        )
    }

    fn server_verify_data(&self) -> Vec<u8> {
        crypto::prf(
            &self.master,
            b"server finished",
            &crypto::transcript_hash(&self.messages),
            VERIFY_DATA_LEN,
        )
    }
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.pre_master.zeroize();
        self.master.zeroize();
        self.client_random.zeroize();
        self.server_random.zeroize();
        self.messages.zeroize();
    }
}

/// `type || length(3) || message_seq || fragment_offset(3) ||
/// fragment_length(3)`; fragments always carry the whole message here.
fn header(message_type: u8, sequence: u16, body_len: usize) -> [u8; HEADER_LEN] {
    let length = (body_len as u32).to_be_bytes();
    let mut out = [0u8; HEADER_LEN];
    out[0] = message_type;
    out[1..4].copy_from_slice(&length[1..]);
    out[4..6].copy_from_slice(&sequence.to_be_bytes());
    out[9..12].copy_from_slice(&length[1..]);
    out
}

fn client_hello(state: &HandshakeState) -> Vec<u8> {
    let mut body = Vec::with_capacity(64 + state.cookie.len());
    body.extend_from_slice(&DTLS_VERSION.to_be_bytes());
    body.extend_from_slice(&state.client_random);
    body.push(state.session.len() as u8);
    body.extend_from_slice(&state.session);
    body.push(state.cookie.len() as u8);
    body.extend_from_slice(&state.cookie);
    body.extend_from_slice(&[0x00, 0x02]);
    body.extend_from_slice(&CIPHER_SUITE.to_be_bytes());
    body.extend_from_slice(&[0x01, COMPRESSION]);

    let mut out = header(CLIENT_HELLO, state.client_sequence, body.len()).to_vec();
    out.extend_from_slice(&body);
    out
}

fn client_key_exchange(state: &HandshakeState) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + state.identity.len());
    body.extend_from_slice(&(state.identity.len() as u16).to_be_bytes());
    body.extend_from_slice(&state.identity);

    let mut out =
        header(CLIENT_KEY_EXCHANGE, state.client_sequence, body.len()).to_vec();
    out.extend_from_slice(&body);
    out
}

fn finished(state: &HandshakeState) -> Vec<u8> {
    let body = state.client_verify_data();
    let mut out = header(FINISHED, state.client_sequence, body.len()).to_vec();
    out.extend_from_slice(&body);
    out
}

impl Dtls {
    /// Drives the handshake to completion or fails within `timeout`.
    ///
    /// ```text
    /// -> ClientHello (empty cookie)        (kept out of the transcript)
    /// <- HelloVerifyRequest                (kept out of the transcript)
    /// -> ClientHello (cookie)
    /// <- ServerHello, ServerHelloDone
    /// -> ClientKeyExchange
    /// -> ChangeCipherSpec                  (epoch++, sequence reset)
    /// -> Finished                          (encrypted)
    /// <- ChangeCipherSpec, Finished        (verify data must match)
    /// ```
    pub(crate) fn handshake(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        self.send_client_hello(false)?;
        self.read_flight(deadline)?;
        if self.with_handshake(|hs| hs.cookie.is_empty())? {
            return Err(Error::Handshake("no cookie from server"));
        }

        self.send_client_hello(true)?;
        while !self.with_handshake(|hs| hs.hello_done)? {
            self.read_flight(deadline)?;
        }

        self.send_client_key_exchange()?;
        self.send_change_cipher_spec()?;
        self.derive_keys()?;
        self.send_finished()?;

        while !self.with_handshake(|hs| hs.finished_received)? {
            self.read_flight(deadline)?;
        }
        if !self.with_handshake(|hs| hs.verified)? {
            return Err(Error::Handshake("server verify data mismatch"));
        }

        // Established; drop (and wipe) the handshake state.
        self.state.lock().handshake = None;
        self.io.set_read_timeout(None)?;
        Ok(())
    }

    fn with_handshake<T>(
        &self,
        read: impl FnOnce(&HandshakeState) -> T,
    ) -> Result<T> {
        let state = self.state.lock();
        let handshake = state
            .handshake
            .as_ref()
            .ok_or(Error::Handshake("no handshake in progress"))?;
        Ok(read(handshake))
    }

    fn send_client_hello(&self, with_cookie: bool) -> Result<()> {
        let message = {
            let mut state = self.state.lock();
            let handshake = state
                .handshake
                .as_mut()
                .ok_or(Error::Handshake("no handshake in progress"))?;
            let message = client_hello(handshake);
            handshake.client_sequence += 1;
            if with_cookie {
                handshake.messages.extend_from_slice(&message);
            }
            message
        };
        self.send_record(CONTENT_HANDSHAKE, &message)
    }

    fn send_client_key_exchange(&self) -> Result<()> {
        let message = {
            let mut state = self.state.lock();
            let handshake = state
                .handshake
                .as_mut()
                .ok_or(Error::Handshake("no handshake in progress"))?;
            let message = client_key_exchange(handshake);
            handshake.client_sequence += 1;
            handshake.messages.extend_from_slice(&message);
            message
        };
        self.send_record(CONTENT_HANDSHAKE, &message)
    }

    /// Flips the client to encrypted records: epoch increments, the
    /// sequence number restarts at zero (RFC 6347 §4.1).
    fn send_change_cipher_spec(&self) -> Result<()> {
        self.send_record(
            CONTENT_CHANGE_CIPHER_SPEC,
            &[CHANGE_CIPHER_SPEC_MESSAGE],
        )?;
        let mut state = self.state.lock();
        state.client_epoch += 1;
        state.client_sequence = 0;
        state.client_encrypt = true;
        Ok(())
    }

    fn derive_keys(&self) -> Result<()> {
        let mut state = self.state.lock();
        let handshake = state
            .handshake
            .as_mut()
            .ok_or(Error::Handshake("no handshake in progress"))?;

        let mut randoms = Vec::with_capacity(64);
        randoms.extend_from_slice(&handshake.client_random);
        randoms.extend_from_slice(&handshake.server_random);
        let master =
            crypto::prf(&handshake.pre_master, b"master secret", &randoms, 48);
        handshake.master.copy_from_slice(&master);

        let mut randoms = Vec::with_capacity(64);
        randoms.extend_from_slice(&handshake.server_random);
        randoms.extend_from_slice(&handshake.client_random);
        let key_block =
            crypto::prf(&handshake.master, b"key expansion", &randoms, 40);

        state.client_write_key.copy_from_slice(&key_block[0..16]);
        state.server_write_key.copy_from_slice(&key_block[16..32]);
        state.client_iv.copy_from_slice(&key_block[32..36]);
        state.server_iv.copy_from_slice(&key_block[36..40]);
        Ok(())
    }

    fn send_finished(&self) -> Result<()> {
        let message = {
            let mut state = self.state.lock();
            let handshake = state
                .handshake
                .as_mut()
                .ok_or(Error::Handshake("no handshake in progress"))?;
            let message = finished(handshake);
            handshake.client_sequence += 1;
            // Hashed in plaintext form; the server includes it when
            // computing its own verify data.
            handshake.messages.extend_from_slice(&message);
            message
        };
        self.send_record(CONTENT_HANDSHAKE, &message)
    }

    /// Reads one datagram within the deadline and feeds every handshake
    /// record in it to the state machine.
    fn read_flight(&self, deadline: Instant) -> Result<()> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Timeout("DTLS handshake"))?;
        self.io.set_read_timeout(Some(remaining))?;
        let records = self.read_records().map_err(|err| {
            if transport::is_timeout(&err) {
                Error::Timeout("DTLS handshake")
            } else {
                err
            }
        })?;
        for record in records {
            self.process_record(&record)?;
        }
        Ok(())
    }

    fn process_record(&self, record: &Record) -> Result<()> {
        // ChangeCipherSpec already flipped the decrypt switch during
        // record parsing; only handshake messages carry state here.
        if record.content_type != CONTENT_HANDSHAKE {
            return Ok(());
        }
        let content = &record.content;
        if content.len() < HEADER_LEN {
            return Err(Error::Handshake("short handshake message"));
        }
        let message_type = content[0];
        let length =
            u32::from_be_bytes([0, content[1], content[2], content[3]]) as usize;
        if content.len() < HEADER_LEN + length {
            return Err(Error::Handshake("truncated handshake message"));
        }

        let mut state = self.state.lock();
        let handshake = state
            .handshake
            .as_mut()
            .ok_or(Error::Handshake("no handshake in progress"))?;
        handshake.server_sequence =
            u16::from_be_bytes([content[4], content[5]]);

        match message_type {
            HELLO_VERIFY_REQUEST => {
                let cookie_len = *content
                    .get(HEADER_LEN + 2)
                    .ok_or(Error::Handshake("malformed hello verify"))?
                    as usize;
                let start = HEADER_LEN + 3;
                handshake.cookie = content
                    .get(start..start + cookie_len)
                    .ok_or(Error::Handshake("malformed hello verify"))?
                    .to_vec();
            }
            SERVER_HELLO => {
                let random = content
                    .get(HEADER_LEN + 2..HEADER_LEN + 34)
                    .ok_or(Error::Handshake("malformed server hello"))?;
                handshake.server_random.copy_from_slice(random);
                let session_len = *content
                    .get(HEADER_LEN + 34)
                    .ok_or(Error::Handshake("malformed server hello"))?
                    as usize;
                let start = HEADER_LEN + 35;
                handshake.session = content
                    .get(start..start + session_len)
                    .ok_or(Error::Handshake("malformed server hello"))?
                    .to_vec();
                handshake
                    .messages
                    .extend_from_slice(&content[..HEADER_LEN + length]);
            }
            SERVER_HELLO_DONE => {
                handshake
                    .messages
                    .extend_from_slice(&content[..HEADER_LEN + length]);
                handshake.hello_done = true;
            }
            FINISHED => {
                let expected = handshake.server_verify_data();
                let received = content
                    .get(HEADER_LEN..HEADER_LEN + VERIFY_DATA_LEN)
                    .ok_or(Error::Handshake("malformed finished"))?;
                handshake.finished_received = true;
                handshake.verified = expected.as_slice() == received;
            }
            _ => {}
        }
        Ok(())
    }
}
