//! The LwM2M object model: static definitions, runtime addressing
//! descriptors and the resource store contract.
//!
//! The agent never owns resource storage. It addresses entities through the
//! descriptor types here and delegates all reads and writes to a [`Handler`]
//! implementation, which answers with CoAP codes.

use std::sync::Arc;

use crate::coap::Code;

/// Security object id (OMA LwM2M 1.0 Appendix E.1).
pub const OBJECT_SECURITY: u16 = 0;
/// Server object id (OMA LwM2M 1.0 Appendix E.2).
pub const OBJECT_SERVER: u16 = 1;

/// `LWM2M Server URI` resource of the security object.
pub const RESOURCE_SECURITY_URI: u16 = 0;
/// `Bootstrap-Server` resource of the security object.
pub const RESOURCE_SECURITY_BOOTSTRAP: u16 = 1;
/// `Public Key or Identity` resource of the security object.
pub const RESOURCE_SECURITY_IDENTITY: u16 = 3;
/// `Secret Key` resource of the security object.
pub const RESOURCE_SECURITY_SECRET_KEY: u16 = 5;
/// `Short Server ID` resource of the security object.
pub const RESOURCE_SECURITY_SHORT_SERVER_ID: u16 = 10;
/// `Short Server ID` resource of the server object.
pub const RESOURCE_SERVER_SHORT_SERVER_ID: u16 = 0;
/// `Lifetime` resource of the server object.
pub const RESOURCE_SERVER_LIFETIME: u16 = 1;

/// Resource data types (OMA LwM2M 1.0 Appendix C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    /// UTF-8 text.
    String,
    /// Signed integer, 1/2/4/8 bytes on the wire.
    Integer,
    /// IEEE-754, 4 or 8 bytes on the wire.
    Float,
    /// One byte, `0x00` or `0x01`.
    Boolean,
    /// Raw bytes, exchanged as base64 in string form.
    Opaque,
    /// Unix time, encoded like `Integer`.
    Time,
    /// Object link: two big-endian signed 16-bit values.
    Objlnk,
    /// No value (executable resources).
    None,
}

impl ResourceType {
    /// Maps a schema type name; anything unrecognized is `None`.
    pub fn from_name(name: &str) -> ResourceType {
        match name {
            "String" => ResourceType::String,
            "Integer" => ResourceType::Integer,
            "Float" => ResourceType::Float,
            "Boolean" => ResourceType::Boolean,
            "Opaque" => ResourceType::Opaque,
            "Time" => ResourceType::Time,
            "Objlnk" => ResourceType::Objlnk,
            _ => ResourceType::None,
        }
    }
}

/// Static schema of one resource, immutable after load.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub id: u16,
    pub name: String,
    pub multi: bool,
    pub mandatory: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub kind: ResourceType,
}

impl ResourceDef {
    /// Sets the permission flags from a schema operations string
    /// (any combination of `R`, `W` and `E`).
    pub fn set_operations(&mut self, operations: &str) {
        self.readable = operations.contains('R');
        self.writable = operations.contains('W');
        self.executable = operations.contains('E');
    }
}

/// Static schema of one object, immutable after load.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub id: u16,
    pub name: String,
    pub multi: bool,
    pub mandatory: bool,
    pub resources: Vec<Arc<ResourceDef>>,
}

impl ObjectDef {
    /// Looks up a resource definition by id.
    pub fn resource(&self, id: u16) -> Option<&Arc<ResourceDef>> {
        self.resources.iter().find(|r| r.id == id)
    }
}

/// The loaded object catalogue, ordered by object id.
///
/// The schema loader (external to this crate) produces the definitions;
/// the constructor establishes the ordering the agent relies on.
#[derive(Debug, Clone, Default)]
pub struct ObjectDefs(Vec<Arc<ObjectDef>>);

impl ObjectDefs {
    /// Builds the catalogue, sorting the definitions by object id.
    pub fn new(mut definitions: Vec<ObjectDef>) -> ObjectDefs {
        definitions.sort_by_key(|d| d.id);
        ObjectDefs(definitions.into_iter().map(Arc::new).collect())
    }

    /// Looks up an object definition by id.
    pub fn object(&self, id: u16) -> Option<&Arc<ObjectDef>> {
        self.0.iter().find(|d| d.id == id)
    }

    /// Looks up a resource definition by object and resource id.
    pub fn resource(
        &self,
        object_id: u16,
        resource_id: u16,
    ) -> Option<&Arc<ResourceDef>> {
        self.object(object_id)?.resource(resource_id)
    }

    /// Iterates the definitions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ObjectDef>> {
        self.0.iter()
    }
}

/// Addresses one object type.
#[derive(Debug, Clone)]
pub struct Object {
    pub id: u16,
    pub definition: Option<Arc<ObjectDef>>,
}

/// Addresses one instance of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub object_id: u16,
    pub id: u16,
}

/// Addresses one resource of an instance, with its type information.
#[derive(Debug, Clone)]
pub struct Resource {
    pub object_id: u16,
    pub instance_id: u16,
    pub id: u16,
    pub definition: Arc<ResourceDef>,
}

impl Resource {
    /// The `/object/instance/resource` path, for diagnostics.
    pub fn path(&self) -> String {
        format!("/{}/{}/{}", self.object_id, self.instance_id, self.id)
    }
}

/// Synchronous resource store behind the agent.
///
/// Values cross this boundary in their human string form: integers as
/// signed decimals, booleans as `"true"`/`"false"`, opaque data as
/// standard base64, object links as `"<obj>:<inst>"`. Every operation
/// answers with the CoAP code the agent should relay.
pub trait Handler: Send + Sync {
    /// Removes an object and everything under it. Usually `Deleted`.
    fn delete_object(&self, object: &Object) -> Code;

    /// Creates an empty instance. Usually `Created`.
    fn create_instance(&self, instance: &Instance) -> Code;

    /// Available object ids, ascending. Usually `Content`.
    fn list_object_ids(&self) -> (Vec<u16>, Code);

    /// Instance ids of an object, ascending. Usually `Content`.
    fn list_instance_ids(&self, object: &Object) -> (Vec<u16>, Code);

    /// Resource ids of an instance, ascending. Usually `Content`.
    fn list_resource_ids(&self, instance: &Instance) -> (Vec<u16>, Code);

    /// Reads a resource value. Usually `Content`.
    fn read_resource(&self, resource: &Resource) -> (String, Code);

    /// Writes a resource value. Usually `Changed`.
    fn write_resource(&self, resource: &Resource, value: &str) -> Code;

    /// Executes a resource with a base64 argument. Usually `Changed`.
    fn execute_resource(&self, resource: &Resource, value: &str) -> Code;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: u16) -> ObjectDef {
        ObjectDef {
            id,
            name: format!("object {}", id),
            multi: false,
            mandatory: false,
            resources: vec![Arc::new(ResourceDef {
                id: 0,
                name: "value".to_string(),
                multi: false,
                mandatory: true,
                readable: true,
                writable: false,
                executable: false,
                kind: ResourceType::Integer,
            })],
        }
    }

    #[test]
    fn catalogue_sorts_by_id() {
        let defs =
            ObjectDefs::new(vec![definition(3), definition(0), definition(1)]);
        let ids: Vec<u16> = defs.iter().map(|d| d.id).collect();
        assert_eq!(vec![0, 1, 3], ids);
    }

    #[test]
    fn catalogue_lookup() {
        let defs = ObjectDefs::new(vec![definition(3)]);
        assert!(defs.object(3).is_some());
        assert!(defs.object(4).is_none());
        assert!(defs.resource(3, 0).is_some());
        assert!(defs.resource(3, 1).is_none());
    }

    #[test]
    fn operations_string() {
        let mut def = ResourceDef {
            id: 0,
            name: String::new(),
            multi: false,
            mandatory: false,
            readable: false,
            writable: false,
            executable: false,
            kind: ResourceType::None,
        };
        def.set_operations("RW");
        assert!(def.readable && def.writable && !def.executable);
        def.set_operations("E");
        assert!(!def.readable && !def.writable && def.executable);
    }
}
