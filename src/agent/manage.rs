//! Server-initiated Read, Write and Execute, and the observe/notify
//! machinery (OMA LwM2M 1.0 §5.4, §5.5).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::coap::{
    Channel, Code, Message, Opt, CONTENT_FORMAT_LWM2M_TLV,
    OBSERVE_REGISTER, OPTION_CONTENT_FORMAT, OPTION_OBSERVE,
};
use crate::model::{Instance, Resource};
use crate::tlv::{self, Tlv, TlvType};
use crate::Error;

use super::{resource_path, Agent};

/// One observed single resource. `last_value` is the change detector;
/// `message_id` identifies the notify a server reset refers to.
pub(crate) struct ObservedResource {
    pub token: Vec<u8>,
    pub message_id: u16,
    pub observe_count: u32,
    pub resource: Resource,
    pub last_value: String,
}

/// One observed instance, with the readable resources captured at
/// registration time.
pub(crate) struct ObservedInstance {
    pub token: Vec<u8>,
    pub message_id: u16,
    pub observe_count: u32,
    pub instance: Instance,
    pub resources: Vec<ObservedResource>,
}

/// The registration response counts as observation zero, so change
/// notifications start at one.
const FIRST_NOTIFICATION: u32 = 1;

/// Packs the observe counter into the fewest of 1–4 big-endian bytes.
fn pack_observe_count(count: u32) -> Vec<u8> {
    let bytes = count.to_be_bytes();
    match count {
        0..=0xFF => bytes[3..].to_vec(),
        0x100..=0xFFFF => bytes[2..].to_vec(),
        0x1_0000..=0xFF_FFFF => bytes[1..].to_vec(),
        _ => bytes.to_vec(),
    }
}

fn tlv_content_format() -> Opt {
    Opt::new(
        OPTION_CONTENT_FORMAT,
        CONTENT_FORMAT_LWM2M_TLV.to_be_bytes(),
    )
}

fn notify_options(count: u32) -> Vec<Opt> {
    vec![
        tlv_content_format(),
        Opt::new(OPTION_OBSERVE, pack_observe_count(count)),
    ]
}

impl Agent {
    /// One observe scan: reads every observed target and notifies the
    /// values that changed since the last scan. Quiet when nothing
    /// changed, disconnected or not registered.
    pub fn observe(&self) {
        let mut state = self.state.lock();
        if !state.registered {
            return;
        }
        let channel = match state.connection.clone() {
            Some(channel) => channel,
            None => return,
        };
        for entry in &mut state.observed_instances {
            self.notify_instance(&channel, entry);
        }
        for entry in &mut state.observed_resources {
            self.notify_resource(&channel, entry);
        }
    }

    /// Instance-level notify: TLVs only for the resources whose value
    /// changed.
    fn notify_instance(&self, channel: &Channel, entry: &mut ObservedInstance) {
        let mut payload = Vec::new();
        for observed in &mut entry.resources {
            if !observed.resource.definition.readable {
                continue;
            }
            let (value, code) = self.handler.read_resource(&observed.resource);
            if code != Code::Content || value == observed.last_value {
                continue;
            }
            let bytes =
                tlv::string_to_value(&value, observed.resource.definition.kind);
            observed.last_value = value;
            payload.extend_from_slice(
                &Tlv::new(TlvType::Resource, observed.resource.id, bytes)
                    .marshal(),
            );
        }
        if payload.is_empty() {
            return;
        }

        log::info!(
            "notify /{}/{}",
            entry.instance.object_id,
            entry.instance.id
        );
        let options = notify_options(entry.observe_count);
        entry.observe_count += 1;
        match channel.send_related(
            Code::Content,
            entry.token.clone(),
            options,
            payload,
        ) {
            Ok(message_id) => entry.message_id = message_id,
            Err(err) => log::warn!("notify failed: {}", err),
        }
    }

    fn notify_resource(&self, channel: &Channel, entry: &mut ObservedResource) {
        if !entry.resource.definition.readable {
            return;
        }
        let (value, code) = self.handler.read_resource(&entry.resource);
        if code != Code::Content || value == entry.last_value {
            return;
        }

        log::info!("notify {}", entry.resource.path());
        let bytes = tlv::string_to_value(&value, entry.resource.definition.kind);
        entry.last_value = value;
        let payload =
            Tlv::new(TlvType::Resource, entry.resource.id, bytes).marshal();
        let options = notify_options(entry.observe_count);
        entry.observe_count += 1;
        match channel.send_related(
            Code::Content,
            entry.token.clone(),
            options,
            payload,
        ) {
            Ok(message_id) => entry.message_id = message_id,
            Err(err) => log::warn!("notify failed: {}", err),
        }
    }

    /// Drops the observation whose last notify the server reset.
    pub(crate) fn observe_deregister(&self, message: &Message) {
        let mut state = self.state.lock();
        if let Some(index) = state
            .observed_instances
            .iter()
            .position(|o| o.message_id == message.message_id)
        {
            let removed = state.observed_instances.remove(index);
            log::info!(
                "cancel observe /{}/{}",
                removed.instance.object_id,
                removed.instance.id
            );
            return;
        }
        if let Some(index) = state
            .observed_resources
            .iter()
            .position(|o| o.message_id == message.message_id)
        {
            let removed = state.observed_resources.remove(index);
            log::info!("cancel observe {}", removed.resource.path());
        }
    }

    /// GET: Read on an instance or a single resource; with the observe
    /// option it also registers an observation.
    pub(crate) fn read_request(&self, message: &Message) {
        match resource_path(message) {
            Ok((2, ids)) => self.read_instance(ids[0], ids[1], message),
            Ok((3, ids)) => self.read_single(ids[0], ids[1], ids[2], message),
            Ok(_) => self.protocol_reply(message, "unsupported read depth"),
            Err(err) => self.protocol_reply(message, &err.to_string()),
        }
    }

    fn read_instance(&self, object_id: u16, instance_id: u16, message: &Message) {
        let instance = match self.find_instance(object_id, instance_id) {
            Some(instance) => instance,
            None => {
                log::info!("read /{}/{} not found", object_id, instance_id);
                self.respond(message, Code::NotFound, Vec::new(), Vec::new());
                return;
            }
        };
        let is_observe = message.is_observe();
        if is_observe {
            log::info!("observe /{}/{}", object_id, instance_id);
        } else {
            log::info!("read /{}/{}", object_id, instance_id);
        }

        let (resource_ids, code) = self.handler.list_resource_ids(&instance);
        if code != Code::Content {
            self.respond(
                message,
                Code::MethodNotAllowed,
                Vec::new(),
                Vec::new(),
            );
            return;
        }

        let mut payload = Vec::new();
        let mut captured = Vec::new();
        for resource_id in resource_ids {
            let resource =
                match self.find_resource(object_id, instance_id, resource_id) {
                    Some(resource) => resource,
                    None => continue,
                };
            if !resource.definition.readable {
                continue;
            }
            let (value, code) = self.handler.read_resource(&resource);
            if code != Code::Content {
                continue;
            }
            let bytes = tlv::string_to_value(&value, resource.definition.kind);
            payload.extend_from_slice(
                &Tlv::new(TlvType::Resource, resource_id, bytes).marshal(),
            );
            if is_observe {
                captured.push(ObservedResource {
                    token: Vec::new(),
                    message_id: 0,
                    observe_count: FIRST_NOTIFICATION,
                    resource,
                    last_value: value,
                });
            }
        }

        let mut options = vec![tlv_content_format()];
        if is_observe {
            options.push(Opt::new(OPTION_OBSERVE, [OBSERVE_REGISTER]));
            self.state.lock().observed_instances.push(ObservedInstance {
                token: message.token.clone(),
                message_id: 0,
                observe_count: FIRST_NOTIFICATION,
                instance,
                resources: captured,
            });
        }
        self.respond(message, Code::Content, options, payload);
    }

    fn read_single(
        &self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        message: &Message,
    ) {
        let resource =
            match self.find_resource(object_id, instance_id, resource_id) {
                Some(resource) => resource,
                None => {
                    log::info!(
                        "read /{}/{}/{} not found",
                        object_id,
                        instance_id,
                        resource_id
                    );
                    self.respond(
                        message,
                        Code::NotFound,
                        Vec::new(),
                        Vec::new(),
                    );
                    return;
                }
            };
        let is_observe = message.is_observe();
        if is_observe {
            log::info!("observe {}", resource.path());
        } else {
            log::info!("read {}", resource.path());
        }

        if !resource.definition.readable {
            self.respond(
                message,
                Code::MethodNotAllowed,
                Vec::new(),
                Vec::new(),
            );
            return;
        }
        let (value, code) = self.handler.read_resource(&resource);
        if code != Code::Content {
            self.respond(
                message,
                Code::MethodNotAllowed,
                Vec::new(),
                Vec::new(),
            );
            return;
        }

        let bytes = tlv::string_to_value(&value, resource.definition.kind);
        let payload =
            Tlv::new(TlvType::Resource, resource_id, bytes).marshal();

        let mut options = vec![tlv_content_format()];
        if is_observe {
            options.push(Opt::new(OPTION_OBSERVE, [OBSERVE_REGISTER]));
            self.state.lock().observed_resources.push(ObservedResource {
                token: message.token.clone(),
                message_id: 0,
                observe_count: FIRST_NOTIFICATION,
                resource,
                last_value: value,
            });
        }
        self.respond(message, Code::Content, options, payload);
    }

    /// PUT: Write on a single resource, TLV payload.
    pub(crate) fn write_request(&self, message: &Message) {
        let (object_id, instance_id, resource_id) =
            match resource_path(message) {
                Ok((3, ids)) => (ids[0], ids[1], ids[2]),
                Ok(_) => {
                    self.protocol_reply(message, "unsupported write depth");
                    return;
                }
                Err(err) => {
                    self.protocol_reply(message, &err.to_string());
                    return;
                }
            };
        log::info!("write /{}/{}/{}", object_id, instance_id, resource_id);

        if self.find_instance(object_id, instance_id).is_none() {
            self.respond(message, Code::NotFound, Vec::new(), Vec::new());
            return;
        }
        // A resource the store does not hold yet is created on write, as
        // long as the catalogue defines it.
        let resource = self
            .find_resource(object_id, instance_id, resource_id)
            .or_else(|| {
                let definition =
                    self.definitions.resource(object_id, resource_id)?;
                Some(Resource {
                    object_id,
                    instance_id,
                    id: resource_id,
                    definition: definition.clone(),
                })
            });
        let resource = match resource {
            Some(resource) => resource,
            None => {
                self.respond(message, Code::NotFound, Vec::new(), Vec::new());
                return;
            }
        };

        if !resource.definition.writable {
            self.respond(
                message,
                Code::MethodNotAllowed,
                Vec::new(),
                Vec::new(),
            );
            return;
        }

        let record = match Tlv::unmarshal(&message.payload) {
            Some((record, _)) => record,
            None => {
                self.protocol_reply(message, "undecodable TLV payload");
                return;
            }
        };
        let value =
            tlv::value_to_string(&record.value, resource.definition.kind);
        let code = self.handler.write_resource(&resource, &value);
        if code != Code::Changed {
            log::warn!("write {} refused: {}", resource.path(), code);
        }
        self.respond(message, code, Vec::new(), Vec::new());
    }

    /// POST: Execute on a single resource; the payload travels to the
    /// store as base64.
    pub(crate) fn execute_request(&self, message: &Message) {
        let (object_id, instance_id, resource_id) =
            match resource_path(message) {
                Ok((3, ids)) => (ids[0], ids[1], ids[2]),
                Ok(_) => {
                    self.protocol_reply(message, "unsupported execute depth");
                    return;
                }
                Err(err) => {
                    self.protocol_reply(message, &err.to_string());
                    return;
                }
            };
        log::info!("execute /{}/{}/{}", object_id, instance_id, resource_id);

        let resource =
            match self.find_resource(object_id, instance_id, resource_id) {
                Some(resource) => resource,
                None => {
                    self.respond(
                        message,
                        Code::NotFound,
                        Vec::new(),
                        Vec::new(),
                    );
                    return;
                }
            };
        if !resource.definition.executable {
            self.respond(
                message,
                Code::MethodNotAllowed,
                Vec::new(),
                Vec::new(),
            );
            return;
        }

        let value = BASE64.encode(&message.payload);
        let code = self.handler.execute_resource(&resource, &value);
        if code != Code::Changed {
            log::warn!("execute {} refused: {}", resource.path(), code);
        }
        self.respond(message, code, Vec::new(), Vec::new());
    }

    pub(crate) fn respond(
        &self,
        request: &Message,
        code: Code,
        options: Vec<Opt>,
        payload: Vec<u8>,
    ) {
        if let Some(channel) = self.channel() {
            if let Err(err) =
                channel.send_response(request, code, options, payload)
            {
                log::warn!("response failed: {}", err);
            }
        }
    }

    /// A malformed request is logged and answered 4.00.
    pub(crate) fn protocol_reply(&self, request: &Message, reason: &str) {
        log::warn!("{}", Error::Protocol(reason.to_string()));
        self.respond(request, Code::BadRequest, Vec::new(), Vec::new());
    }
}
