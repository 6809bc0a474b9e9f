//! The CoAP request/response channel over a datagram transport.
//!
//! One background receiver per channel parses incoming datagrams in
//! arrival order, hands each message to the owner's handler and then
//! fulfils the pending completion when the message acknowledges an
//! outstanding confirmable request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::Rng;

use super::message::{Code, Message, MessageType, Opt};
use crate::transport::{self, Transport};
use crate::Result;

/// How often the receiver re-checks the stop flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const READ_BUFFER: usize = 1500;
const TOKEN_LENGTH: usize = 8;

/// Invoked for every well-formed incoming message, in arrival order.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// A CoAP endpoint bound to one transport.
pub struct Channel {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    transport: Box<dyn Transport>,
    next_message_id: Mutex<u16>,
    pending: Mutex<HashMap<u16, Sender<()>>>,
    stop: AtomicBool,
}

impl Channel {
    /// Opens the channel and spawns the background receiver.
    pub fn open(transport: Box<dyn Transport>, handler: MessageHandler) -> Channel {
        let _ = transport.set_read_timeout(Some(POLL_INTERVAL));
        let shared = Arc::new(Shared {
            transport,
            next_message_id: Mutex::new(rand::thread_rng().gen()),
            pending: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let receiver = thread::spawn(move || worker.run(handler));
        Channel {
            shared,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Sends a confirmable request with a fresh random token, returning
    /// the message id and the completion that fires when the matching
    /// acknowledgement arrives.
    pub fn send_request(
        &self,
        code: Code,
        options: Vec<Opt>,
        payload: Vec<u8>,
    ) -> Result<(u16, Receiver<()>)> {
        let message_id = self.shared.take_message_id();
        let mut token = vec![0u8; TOKEN_LENGTH];
        rand::thread_rng().fill(&mut token[..]);

        let (done, completion) = bounded(1);
        self.shared.pending.lock().insert(message_id, done);

        let message = Message {
            mtype: MessageType::Confirmable,
            code,
            message_id,
            token,
            options,
            payload,
        };
        if let Err(err) = self.shared.transport.send(&message.to_bytes()) {
            self.shared.pending.lock().remove(&message_id);
            return Err(err);
        }
        Ok((message_id, completion))
    }

    /// Sends an acknowledgement re-using the request's id and token.
    pub fn send_response(
        &self,
        request: &Message,
        code: Code,
        options: Vec<Opt>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let message = Message {
            mtype: MessageType::Acknowledgement,
            code,
            message_id: request.message_id,
            token: request.token.clone(),
            options,
            payload,
        };
        self.shared.transport.send(&message.to_bytes())?;
        Ok(())
    }

    /// Sends a non-confirmable message carrying a prior subscriber's
    /// token (the Notify flow), returning its message id.
    pub fn send_related(
        &self,
        code: Code,
        token: Vec<u8>,
        options: Vec<Opt>,
        payload: Vec<u8>,
    ) -> Result<u16> {
        let message_id = self.shared.take_message_id();
        let message = Message {
            mtype: MessageType::NonConfirmable,
            code,
            message_id,
            token,
            options,
            payload,
        };
        self.shared.transport.send(&message.to_bytes())?;
        Ok(message_id)
    }

    /// Abandons a pending completion after a caller-side timeout.
    pub fn forget(&self, message_id: u16) {
        self.shared.pending.lock().remove(&message_id);
    }

    /// Stops and joins the receiver; outstanding completions observe a
    /// closed channel. Must not be called while holding locks the
    /// handler also takes.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        self.shared.pending.lock().clear();
    }
}

impl Shared {
    fn take_message_id(&self) -> u16 {
        let mut next = self.next_message_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    fn run(&self, handler: MessageHandler) {
        let mut buf = [0u8; READ_BUFFER];
        while !self.stop.load(Ordering::Relaxed) {
            let len = match self.transport.recv(&mut buf) {
                Ok(len) => len,
                Err(err) if transport::is_timeout(&err) => continue,
                Err(err) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        log::debug!("CoAP receiver exiting: {}", err);
                    }
                    break;
                }
            };
            let message = match Message::parse(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    log::warn!("dropping undecodable CoAP datagram: {}", err);
                    continue;
                }
            };
            handler(&message);
            if message.mtype == MessageType::Acknowledgement {
                if let Some(done) =
                    self.pending.lock().remove(&message.message_id)
                {
                    let _ = done.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::OPTION_URI_PATH;
    use crate::transport::pipe;

    fn quiet_handler() -> MessageHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn request_completes_on_matching_ack() {
        let (near, far) = pipe::pair();
        let channel = Channel::open(Box::new(near), quiet_handler());

        let (message_id, completion) = channel
            .send_request(
                Code::Post,
                vec![Opt::new(OPTION_URI_PATH, "rd")],
                Vec::new(),
            )
            .unwrap();

        let request = Message::parse(
            &far.take_datagram(Duration::from_secs(1)).unwrap(),
        )
        .unwrap();
        assert_eq!(MessageType::Confirmable, request.mtype);
        assert_eq!(message_id, request.message_id);
        assert_eq!(TOKEN_LENGTH, request.token.len());

        // An unrelated acknowledgement must not complete the request.
        let unrelated = Message {
            mtype: MessageType::Acknowledgement,
            code: Code::Created,
            message_id: message_id.wrapping_add(1),
            token: request.token.clone(),
            options: Vec::new(),
            payload: Vec::new(),
        };
        far.push_datagram(unrelated.to_bytes());
        assert!(completion.recv_timeout(Duration::from_millis(100)).is_err());

        let ack = Message {
            message_id,
            ..unrelated
        };
        far.push_datagram(ack.to_bytes());
        completion.recv_timeout(Duration::from_secs(1)).unwrap();

        channel.close();
    }

    #[test]
    fn handler_runs_before_completion() {
        let (near, far) = pipe::pair();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let channel = Channel::open(
            Box::new(near),
            Arc::new(move |_| seen.lock().push("handler")),
        );

        let (message_id, completion) =
            channel.send_request(Code::Post, Vec::new(), Vec::new()).unwrap();
        let _ = far.take_datagram(Duration::from_secs(1)).unwrap();
        far.push_datagram(
            Message {
                mtype: MessageType::Acknowledgement,
                code: Code::Changed,
                message_id,
                token: Vec::new(),
                options: Vec::new(),
                payload: Vec::new(),
            }
            .to_bytes(),
        );
        completion.recv_timeout(Duration::from_secs(1)).unwrap();
        order.lock().push("completion");
        assert_eq!(vec!["handler", "completion"], *order.lock());

        channel.close();
    }

    #[test]
    fn message_id_wraps_to_initial_value() {
        let (near, _far) = pipe::pair();
        let channel = Channel::open(Box::new(near), quiet_handler());

        let (first, _) =
            channel.send_request(Code::Post, Vec::new(), Vec::new()).unwrap();
        let mut last = first;
        for _ in 0..65536 {
            let (id, _) = channel
                .send_request(Code::Post, Vec::new(), Vec::new())
                .unwrap();
            last = id;
        }
        // The 65537th request re-uses the initial id.
        assert_eq!(first, last);

        channel.close();
    }

    #[test]
    fn related_messages_are_non_confirmable() {
        let (near, far) = pipe::pair();
        let channel = Channel::open(Box::new(near), quiet_handler());

        let token = vec![0x01, 0x02, 0x03];
        let message_id = channel
            .send_related(Code::Content, token.clone(), Vec::new(), b"45".to_vec())
            .unwrap();

        let sent = Message::parse(
            &far.take_datagram(Duration::from_secs(1)).unwrap(),
        )
        .unwrap();
        assert_eq!(MessageType::NonConfirmable, sent.mtype);
        assert_eq!(message_id, sent.message_id);
        assert_eq!(token, sent.token);

        channel.close();
    }
}
