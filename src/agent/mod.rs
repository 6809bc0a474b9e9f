//! The LwM2M agent: registration lifecycle, server-initiated operation
//! dispatch and the observe/notify machinery.
//!
//! One agent manages one server relationship. All mutable state lives
//! behind a single lock ([`State`]); request waits never hold it, so the
//! background receiver can dispatch concurrently with the tickers.

pub mod bootstrap;
mod manage;
mod register;
#[cfg(test)]
pub(crate) mod testutil;

use std::str;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use parking_lot::Mutex;

use crate::coap::{
    Channel, Code, Message, MessageType, OPTION_URI_PATH,
};
use crate::model::{
    Handler, Instance, Object, ObjectDefs, Resource, OBJECT_SECURITY,
    OBJECT_SERVER, RESOURCE_SECURITY_BOOTSTRAP,
    RESOURCE_SECURITY_SHORT_SERVER_ID, RESOURCE_SERVER_SHORT_SERVER_ID,
};
use crate::{Error, Result};

use manage::{ObservedInstance, ObservedResource};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_LIFETIME: u64 = 60;
const DEFAULT_SHORT_SERVER_ID: i64 = 123;

const LWM2M_VERSION: &str = "1.0";
/// UDP binding only.
const BINDING_MODE: &str = "U";

/// The agent's mutable state, guarded by one lock.
#[derive(Default)]
pub(crate) struct State {
    pub connection: Option<Arc<Channel>>,
    pub location: String,
    pub registered: bool,
    pub observed_instances: Vec<ObservedInstance>,
    pub observed_resources: Vec<ObservedResource>,
}

/// A device-side LwM2M agent. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Agent {
    endpoint_name: String,
    definitions: Arc<ObjectDefs>,
    handler: Arc<dyn Handler>,
    security_instance: u16,
    server_instance: u16,
    pub(crate) state: Arc<Mutex<State>>,
}

impl Agent {
    /// Builds an agent, locating the security and server instances that
    /// describe its management server. Fails when the resource store
    /// holds no non-bootstrap security instance, or no server instance
    /// matching its short server id.
    pub fn new(
        endpoint_name: impl Into<String>,
        definitions: ObjectDefs,
        handler: Arc<dyn Handler>,
    ) -> Result<Agent> {
        let mut agent = Agent {
            endpoint_name: endpoint_name.into(),
            definitions: Arc::new(definitions),
            handler,
            security_instance: 0,
            server_instance: 0,
            state: Arc::new(Mutex::new(State::default())),
        };
        agent.security_instance =
            agent.find_security_instance().ok_or_else(|| {
                Error::Config(
                    "no management-server security instance (object 0)"
                        .to_string(),
                )
            })?;
        agent.server_instance = agent.find_server_instance().ok_or_else(|| {
            Error::Config(
                "no management-server server instance (object 1)".to_string(),
            )
        })?;
        Ok(agent)
    }

    /// The registration handle from the last successful Register.
    pub fn location(&self) -> String {
        self.state.lock().location.clone()
    }

    /// Whether the agent currently holds a live registration.
    pub fn registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Registers, then keeps the registration fresh at `0.9 × lifetime`
    /// until `stop` fires; the connection is closed on the way out.
    pub fn spawn_update(&self, stop: Receiver<()>) -> JoinHandle<()> {
        let agent = self.clone();
        thread::spawn(move || {
            if let Err(err) = agent.register() {
                log::error!("register failed: {}", err);
            }
            let interval =
                Duration::from_secs(agent.lifetime() * 9 / 10);
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Err(err) = agent.update() {
                            log::error!("update failed: {}", err);
                        }
                    }
                    recv(stop) -> _ => {
                        agent.disconnect();
                        return;
                    }
                }
            }
        })
    }

    /// Scans observations every `interval` until `stop` fires.
    pub fn spawn_observe(
        &self,
        interval: Duration,
        stop: Receiver<()>,
    ) -> JoinHandle<()> {
        let agent = self.clone();
        thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => agent.observe(),
                    recv(stop) -> _ => return,
                }
            }
        })
    }

    /// Dispatches one incoming message from the receiver task.
    pub(crate) fn receive(&self, message: &Message) {
        match message.mtype {
            MessageType::Acknowledgement => match message.code {
                Code::Created => self.register_done(message),
                Code::Changed => log::debug!("update acknowledged"),
                _ => {}
            },
            MessageType::Confirmable => match message.code {
                // Observe arrives as GET too; it is a Read that also
                // subscribes.
                Code::Get => self.read_request(message),
                Code::Put => self.write_request(message),
                Code::Post => self.execute_request(message),
                _ => self.protocol_reply(message, "unexpected request code"),
            },
            // A reset answers a notify whose observation is gone.
            MessageType::Reset => self.observe_deregister(message),
            MessageType::NonConfirmable => {}
        }
    }

    fn object(&self, id: u16) -> Object {
        Object {
            id,
            definition: self.definitions.object(id).cloned(),
        }
    }

    /// The object-0 instance describing the management server: the one
    /// whose bootstrap flag reads `"false"`.
    fn find_security_instance(&self) -> Option<u16> {
        let object = self.object(OBJECT_SECURITY);
        let (instances, code) = self.handler.list_instance_ids(&object);
        if code != Code::Content {
            return None;
        }
        instances.into_iter().find(|&instance_id| {
            self.read_value(
                OBJECT_SECURITY,
                instance_id,
                RESOURCE_SECURITY_BOOTSTRAP,
            )
            .as_deref()
                == Some("false")
        })
    }

    /// The object-1 instance whose short server id matches the security
    /// instance's.
    fn find_server_instance(&self) -> Option<u16> {
        let object = self.object(OBJECT_SERVER);
        let (instances, code) = self.handler.list_instance_ids(&object);
        if code != Code::Content {
            return None;
        }
        let expected = self.short_server_id();
        instances.into_iter().find(|&instance_id| {
            self.read_value(
                OBJECT_SERVER,
                instance_id,
                RESOURCE_SERVER_SHORT_SERVER_ID,
            )
            .and_then(|value| value.parse::<i64>().ok())
                == Some(expected)
        })
    }

    fn short_server_id(&self) -> i64 {
        self.read_value(
            OBJECT_SECURITY,
            self.security_instance,
            RESOURCE_SECURITY_SHORT_SERVER_ID,
        )
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_SHORT_SERVER_ID)
    }

    /// Resolves an instance if the store lists it.
    pub(crate) fn find_instance(
        &self,
        object_id: u16,
        instance_id: u16,
    ) -> Option<Instance> {
        let (objects, code) = self.handler.list_object_ids();
        if code != Code::Content || !objects.contains(&object_id) {
            return None;
        }
        let (instances, code) =
            self.handler.list_instance_ids(&self.object(object_id));
        if code != Code::Content || !instances.contains(&instance_id) {
            return None;
        }
        Some(Instance {
            object_id,
            id: instance_id,
        })
    }

    /// Resolves a resource if the store lists it and the catalogue
    /// defines it.
    pub(crate) fn find_resource(
        &self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Option<Resource> {
        let instance = self.find_instance(object_id, instance_id)?;
        let (resources, code) = self.handler.list_resource_ids(&instance);
        if code != Code::Content || !resources.contains(&resource_id) {
            return None;
        }
        let definition = self.definitions.resource(object_id, resource_id)?;
        Some(Resource {
            object_id,
            instance_id,
            id: resource_id,
            definition: Arc::clone(definition),
        })
    }

    /// Reads a resource value, `None` unless the store answers Content.
    pub(crate) fn read_value(
        &self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Option<String> {
        let resource =
            self.find_resource(object_id, instance_id, resource_id)?;
        let (value, code) = self.handler.read_resource(&resource);
        (code == Code::Content).then_some(value)
    }

    pub(crate) fn channel(&self) -> Option<Arc<Channel>> {
        self.state.lock().connection.clone()
    }
}

/// Extracts the 1–3 numeric ids from the request's Uri-Path options.
pub(crate) fn resource_path(message: &Message) -> Result<(usize, [u16; 3])> {
    let mut ids = [0u16; 3];
    let mut count = 0;
    for option in &message.options {
        if option.number != OPTION_URI_PATH {
            continue;
        }
        if count == ids.len() {
            return Err(Error::Protocol("resource path too deep".to_string()));
        }
        let segment = str::from_utf8(&option.value).map_err(|_| {
            Error::Protocol("non-UTF-8 path segment".to_string())
        })?;
        ids[count] = segment.parse().map_err(|_| {
            Error::Protocol(format!("non-numeric path segment {:?}", segment))
        })?;
        count += 1;
    }
    Ok((count, ids))
}

#[cfg(test)]
mod tests {
    use super::testutil::{definitions, seeded_handler};
    use super::*;
    use crate::coap::Opt;

    #[test]
    fn discovers_management_server_instances() {
        let agent = Agent::new(
            "device-1",
            definitions(),
            Arc::new(seeded_handler()),
        )
        .unwrap();
        assert_eq!(0, agent.security_instance);
        assert_eq!(0, agent.server_instance);
    }

    #[test]
    fn rejects_store_without_security_instance() {
        let handler = seeded_handler();
        handler.remove(OBJECT_SECURITY, 0, RESOURCE_SECURITY_BOOTSTRAP);
        let result =
            Agent::new("device-1", definitions(), Arc::new(handler));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn path_extraction() {
        let message = Message {
            mtype: MessageType::Confirmable,
            code: Code::Get,
            message_id: 1,
            token: Vec::new(),
            options: vec![
                Opt::new(OPTION_URI_PATH, "3"),
                Opt::new(OPTION_URI_PATH, "0"),
                Opt::new(OPTION_URI_PATH, "9"),
            ],
            payload: Vec::new(),
        };
        assert_eq!((3, [3, 0, 9]), resource_path(&message).unwrap());

        let mut deep = message.clone();
        deep.options.push(Opt::new(OPTION_URI_PATH, "1"));
        assert!(resource_path(&deep).is_err());

        let mut garbled = message;
        garbled.options[1].value = b"abc".to_vec();
        assert!(resource_path(&garbled).is_err());
    }

    #[test]
    fn find_resource_requires_listing_and_definition() {
        let agent = Agent::new(
            "device-1",
            definitions(),
            Arc::new(seeded_handler()),
        )
        .unwrap();
        assert!(agent.find_resource(3, 0, 9).is_some());
        assert!(agent.find_resource(3, 1, 9).is_none());
        assert!(agent.find_resource(4, 0, 9).is_none());
    }
}
