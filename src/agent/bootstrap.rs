//! Bootstrap provisioning over clear CoAP (OMA LwM2M 1.0 §5.2.7).
//!
//! A short-lived flow used before credentials exist: the client asks the
//! bootstrap server to provision it, the server writes security material
//! (read-only flags do not apply here), optionally wipes the old
//! security and server objects, and finally signals completion.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::coap::{
    Channel, Code, Message, MessageType, Opt, OPTION_URI_PATH,
    OPTION_URI_QUERY,
};
use crate::model::{
    Handler, Instance, Object, ObjectDefs, Resource, OBJECT_SECURITY,
    OBJECT_SERVER,
};
use crate::tlv::{self, Tlv};
use crate::transport::Transport;
use crate::{Error, Result};

use super::{resource_path, BOOTSTRAP_TIMEOUT};

/// Runs the whole bootstrap exchange against `host`, blocking until the
/// server signals finish or the 30-second deadline elapses.
pub fn run(
    host: &str,
    endpoint_name: &str,
    definitions: Arc<ObjectDefs>,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(Error::Transport)?;
    socket.connect(host).map_err(Error::Transport)?;
    run_over(Box::new(socket), endpoint_name, definitions, handler)
}

/// The transport-agnostic bootstrap flow.
pub(crate) fn run_over(
    transport: Box<dyn Transport>,
    endpoint_name: &str,
    definitions: Arc<ObjectDefs>,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
    let (finish, finished) = bounded(1);
    let session = Arc::new(Session {
        definitions,
        handler,
        channel: Mutex::new(None),
        finish,
    });

    let receiver = Arc::clone(&session);
    let channel = Arc::new(Channel::open(
        transport,
        Arc::new(move |message| receiver.receive(message)),
    ));
    *session.channel.lock() = Some(Arc::clone(&channel));

    log::info!("starting bootstrap");
    let result = (|| {
        let options = vec![
            Opt::new(OPTION_URI_PATH, "bs"),
            Opt::new(OPTION_URI_QUERY, format!("ep={}", endpoint_name)),
        ];
        let (message_id, completion) =
            channel.send_request(Code::Post, options, Vec::new())?;
        if completion.recv_timeout(remaining(deadline)?).is_err() {
            channel.forget(message_id);
            return Err(Error::Timeout("bootstrap request"));
        }
        finished
            .recv_timeout(remaining(deadline)?)
            .map_err(|_| Error::Timeout("bootstrap"))
    })();
    channel.close();

    if result.is_ok() {
        log::info!("bootstrap finished");
    }
    result
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::Timeout("bootstrap"))
}

struct Session {
    definitions: Arc<ObjectDefs>,
    handler: Arc<dyn Handler>,
    channel: Mutex<Option<Arc<Channel>>>,
    finish: Sender<()>,
}

impl Session {
    fn receive(&self, message: &Message) {
        match message.mtype {
            MessageType::Acknowledgement => {
                if message.code == Code::Changed {
                    log::info!("bootstrap request accepted");
                }
            }
            MessageType::Confirmable => match message.code {
                Code::Put => self.write(message),
                Code::Post => self.finish_request(message),
                Code::Delete => self.delete(message),
                _ => {}
            },
            _ => {}
        }
    }

    fn respond(&self, request: &Message, code: Code) {
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            if let Err(err) =
                channel.send_response(request, code, Vec::new(), Vec::new())
            {
                log::warn!("bootstrap response failed: {}", err);
            }
        }
    }

    /// Bootstrap write: create the instance, then write every TLV record
    /// in the payload. The server may set declaratively read-only
    /// resources here; permission flags are not consulted.
    fn write(&self, message: &Message) {
        let (object_id, instance_id) = match resource_path(message) {
            Ok((2, ids)) => (ids[0], ids[1]),
            Ok(_) | Err(_) => {
                log::warn!("malformed bootstrap write path");
                self.respond(message, Code::BadRequest);
                return;
            }
        };
        log::info!("bootstrap write /{}/{}", object_id, instance_id);

        let instance = Instance {
            object_id,
            id: instance_id,
        };
        let code = self.handler.create_instance(&instance);
        if code != Code::Created {
            log::warn!("bootstrap create /{}/{} refused: {}", object_id, instance_id, code);
            self.respond(message, code);
            return;
        }

        let object = match self.definitions.object(object_id) {
            Some(object) => Arc::clone(object),
            None => {
                log::warn!("bootstrap write for unknown object {}", object_id);
                self.respond(message, Code::BadRequest);
                return;
            }
        };

        let mut index = 0;
        while let Some((record, used)) = Tlv::unmarshal(&message.payload[index..])
        {
            index += used;
            let definition = match object.resource(record.id) {
                Some(definition) => Arc::clone(definition),
                None => {
                    log::warn!(
                        "skipping unknown resource {} in bootstrap write",
                        record.id
                    );
                    continue;
                }
            };
            let value = tlv::value_to_string(&record.value, definition.kind);
            let resource = Resource {
                object_id,
                instance_id,
                id: record.id,
                definition,
            };
            let code = self.handler.write_resource(&resource, &value);
            if code != Code::Changed {
                log::warn!("bootstrap write {} refused: {}", resource.path(), code);
                self.respond(message, code);
                return;
            }
        }
        self.respond(message, Code::Changed);
    }

    /// Bootstrap finish: acknowledge and wake the waiting caller.
    fn finish_request(&self, message: &Message) {
        log::info!("bootstrap finish requested");
        self.respond(message, Code::Changed);
        let _ = self.finish.try_send(());
    }

    /// Bootstrap delete wipes only the security and server objects.
    fn delete(&self, message: &Message) {
        for object_id in [OBJECT_SECURITY, OBJECT_SERVER] {
            self.handler.delete_object(&Object {
                id: object_id,
                definition: self.definitions.object(object_id).cloned(),
            });
        }
        self.respond(message, Code::Deleted);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::super::testutil::{definitions, MemHandler};
    use super::*;
    use crate::tlv::TlvType;
    use crate::transport::pipe;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn full_bootstrap_flow() {
        let handler = Arc::new(MemHandler::default());
        let store = Arc::clone(&handler);
        let (near, far) = pipe::pair();

        let server = thread::spawn(move || {
            // BOOTSTRAP-REQUEST arrives first.
            let request =
                Message::parse(&far.take_datagram(WAIT).unwrap()).unwrap();
            assert_eq!(Code::Post, request.code);
            assert_eq!(
                b"bs".to_vec(),
                request.option(OPTION_URI_PATH).unwrap().value
            );
            assert_eq!(
                b"ep=device-1".to_vec(),
                request.option(OPTION_URI_QUERY).unwrap().value
            );
            far.push_datagram(
                Message {
                    mtype: MessageType::Acknowledgement,
                    code: Code::Changed,
                    message_id: request.message_id,
                    token: request.token.clone(),
                    options: Vec::new(),
                    payload: Vec::new(),
                }
                .to_bytes(),
            );

            // DELETE wipes the old configuration.
            far.push_datagram(
                Message {
                    mtype: MessageType::Confirmable,
                    code: Code::Delete,
                    message_id: 0x21,
                    token: vec![0x01],
                    options: Vec::new(),
                    payload: Vec::new(),
                }
                .to_bytes(),
            );
            let deleted =
                Message::parse(&far.take_datagram(WAIT).unwrap()).unwrap();
            assert_eq!(Code::Deleted, deleted.code);

            // BOOTSTRAP WRITE provisions /0/1, read-only flags ignored.
            let mut payload = Tlv::new(
                TlvType::Resource,
                0,
                b"coaps://mgmt.example.com:5684".to_vec(),
            )
            .marshal();
            payload.extend_from_slice(
                &Tlv::new(TlvType::Resource, 1, vec![0x00]).marshal(),
            );
            payload.extend_from_slice(
                &Tlv::new(TlvType::Resource, 10, vec![0x7B]).marshal(),
            );
            far.push_datagram(
                Message {
                    mtype: MessageType::Confirmable,
                    code: Code::Put,
                    message_id: 0x22,
                    token: vec![0x02],
                    options: vec![
                        Opt::new(OPTION_URI_PATH, "0"),
                        Opt::new(OPTION_URI_PATH, "1"),
                    ],
                    payload,
                }
                .to_bytes(),
            );
            let written =
                Message::parse(&far.take_datagram(WAIT).unwrap()).unwrap();
            assert_eq!(Code::Changed, written.code);

            // BOOTSTRAP-FINISH releases the caller.
            far.push_datagram(
                Message {
                    mtype: MessageType::Confirmable,
                    code: Code::Post,
                    message_id: 0x23,
                    token: vec![0x03],
                    options: Vec::new(),
                    payload: Vec::new(),
                }
                .to_bytes(),
            );
            let finished =
                Message::parse(&far.take_datagram(WAIT).unwrap()).unwrap();
            assert_eq!(Code::Changed, finished.code);
            far
        });

        run_over(
            Box::new(near),
            "device-1",
            Arc::new(definitions()),
            handler,
        )
        .unwrap();
        let _far = server.join().unwrap();

        assert!(store.has_instance(0, 1));
        assert_eq!(
            Some("coaps://mgmt.example.com:5684".to_string()),
            store.get(0, 1, 0)
        );
        assert_eq!(Some("false".to_string()), store.get(0, 1, 1));
        assert_eq!(Some("123".to_string()), store.get(0, 1, 10));
    }

    #[test]
    fn bootstrap_times_out_without_server() {
        // Shrunk deadline is not available; instead the request ACK never
        // arrives and the overall wait is bounded by the request timeout.
        // Use a disconnected far end so the send itself fails fast.
        let (near, far) = pipe::pair();
        drop(far);
        let result = run_over(
            Box::new(near),
            "device-1",
            Arc::new(definitions()),
            Arc::new(MemHandler::default()),
        );
        assert!(result.is_err());
    }
}
