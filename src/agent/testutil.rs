//! In-memory resource store and a small object catalogue for agent
//! tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::coap::Code;
use crate::model::{
    Handler, Instance, Object, ObjectDef, ObjectDefs, Resource, ResourceDef,
    ResourceType,
};

/// A map-backed [`Handler`]; values live under
/// `(object, instance, resource)` keys in their human string form.
#[derive(Default)]
pub(crate) struct MemHandler {
    values: Mutex<BTreeMap<(u16, u16, u16), String>>,
    instances: Mutex<BTreeSet<(u16, u16)>>,
    executed: Mutex<Option<String>>,
}

impl MemHandler {
    pub fn set(&self, object: u16, instance: u16, resource: u16, value: &str) {
        self.values
            .lock()
            .insert((object, instance, resource), value.to_string());
        self.instances.lock().insert((object, instance));
    }

    pub fn get(&self, object: u16, instance: u16, resource: u16) -> Option<String> {
        self.values.lock().get(&(object, instance, resource)).cloned()
    }

    pub fn remove(&self, object: u16, instance: u16, resource: u16) {
        self.values.lock().remove(&(object, instance, resource));
    }

    pub fn last_execute(&self) -> Option<String> {
        self.executed.lock().clone()
    }

    pub fn has_instance(&self, object: u16, instance: u16) -> bool {
        self.instances.lock().contains(&(object, instance))
    }
}

impl Handler for MemHandler {
    fn delete_object(&self, object: &Object) -> Code {
        self.values.lock().retain(|key, _| key.0 != object.id);
        self.instances.lock().retain(|key| key.0 != object.id);
        Code::Deleted
    }

    fn create_instance(&self, instance: &Instance) -> Code {
        self.instances
            .lock()
            .insert((instance.object_id, instance.id));
        Code::Created
    }

    fn list_object_ids(&self) -> (Vec<u16>, Code) {
        let ids: BTreeSet<u16> =
            self.instances.lock().iter().map(|key| key.0).collect();
        (ids.into_iter().collect(), Code::Content)
    }

    fn list_instance_ids(&self, object: &Object) -> (Vec<u16>, Code) {
        let ids: Vec<u16> = self
            .instances
            .lock()
            .iter()
            .filter(|key| key.0 == object.id)
            .map(|key| key.1)
            .collect();
        (ids, Code::Content)
    }

    fn list_resource_ids(&self, instance: &Instance) -> (Vec<u16>, Code) {
        let ids: Vec<u16> = self
            .values
            .lock()
            .keys()
            .filter(|key| key.0 == instance.object_id && key.1 == instance.id)
            .map(|key| key.2)
            .collect();
        (ids, Code::Content)
    }

    fn read_resource(&self, resource: &Resource) -> (String, Code) {
        match self.get(resource.object_id, resource.instance_id, resource.id) {
            Some(value) => (value, Code::Content),
            None => (String::new(), Code::NotFound),
        }
    }

    fn write_resource(&self, resource: &Resource, value: &str) -> Code {
        self.set(resource.object_id, resource.instance_id, resource.id, value);
        Code::Changed
    }

    fn execute_resource(&self, _resource: &Resource, value: &str) -> Code {
        *self.executed.lock() = Some(value.to_string());
        Code::Changed
    }
}

fn resource(
    id: u16,
    name: &str,
    operations: &str,
    kind: ResourceType,
) -> Arc<ResourceDef> {
    let mut def = ResourceDef {
        id,
        name: name.to_string(),
        multi: false,
        mandatory: true,
        readable: false,
        writable: false,
        executable: false,
        kind,
    };
    def.set_operations(operations);
    Arc::new(def)
}

/// Security, server and device objects, enough for the agent flows.
pub(crate) fn definitions() -> ObjectDefs {
    ObjectDefs::new(vec![
        ObjectDef {
            id: 0,
            name: "LWM2M Security".to_string(),
            multi: true,
            mandatory: true,
            resources: vec![
                resource(0, "LWM2M Server URI", "", ResourceType::String),
                resource(1, "Bootstrap-Server", "", ResourceType::Boolean),
                resource(3, "Public Key or Identity", "", ResourceType::Opaque),
                resource(5, "Secret Key", "", ResourceType::Opaque),
                resource(10, "Short Server ID", "", ResourceType::Integer),
            ],
        },
        ObjectDef {
            id: 1,
            name: "LWM2M Server".to_string(),
            multi: true,
            mandatory: true,
            resources: vec![
                resource(0, "Short Server ID", "R", ResourceType::Integer),
                resource(1, "Lifetime", "RW", ResourceType::Integer),
            ],
        },
        ObjectDef {
            id: 3,
            name: "Device".to_string(),
            multi: false,
            mandatory: true,
            resources: vec![
                resource(0, "Manufacturer", "R", ResourceType::String),
                resource(4, "Reboot", "E", ResourceType::None),
                resource(9, "Battery Level", "R", ResourceType::Integer),
            ],
        },
    ])
}

/// A store holding one bootstrapped management server and a device
/// instance.
pub(crate) fn seeded_handler() -> MemHandler {
    let handler = MemHandler::default();
    handler.set(0, 0, 0, "coaps://127.0.0.1:5684");
    handler.set(0, 0, 1, "false");
    // base64 of "device-1-id" and "sesame-psk-16byt".
    handler.set(0, 0, 3, "ZGV2aWNlLTEtaWQ=");
    handler.set(0, 0, 5, "c2VzYW1lLXBzay0xNmJ5dA==");
    handler.set(0, 0, 10, "123");
    handler.set(1, 0, 0, "123");
    handler.set(1, 0, 1, "60");
    handler.set(3, 0, 0, "Ember Systems");
    handler.set(3, 0, 4, "");
    handler.set(3, 0, 9, "45");
    handler
}
