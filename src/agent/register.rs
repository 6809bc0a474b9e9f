//! Register and Update (OMA LwM2M 1.0 §5.3), and the DTLS credentials
//! they run on.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::coap::{
    Channel, Code, Message, Opt, CONTENT_FORMAT_LINK,
    CONTENT_FORMAT_LWM2M_JSON, OPTION_CONTENT_FORMAT, OPTION_LOCATION_PATH,
    OPTION_URI_PATH, OPTION_URI_QUERY,
};
use crate::dtls::Dtls;
use crate::model::{
    OBJECT_SECURITY, OBJECT_SERVER, RESOURCE_SECURITY_IDENTITY,
    RESOURCE_SECURITY_SECRET_KEY, RESOURCE_SECURITY_URI,
    RESOURCE_SERVER_LIFETIME,
};
use crate::transport::Transport;
use crate::{Error, Result};

use super::{
    Agent, BINDING_MODE, DEFAULT_LIFETIME, LWM2M_VERSION, REGISTER_TIMEOUT,
    UPDATE_TIMEOUT,
};

impl Agent {
    /// Fails unless both PSK identity and key are present; callers should
    /// bootstrap (or provision out of band) first.
    pub fn check_security_params(&self) -> Result<()> {
        if self.identity().is_empty() || self.secret_key().is_empty() {
            return Err(Error::Config(
                "PSK identity or key missing; bootstrap first".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens the DTLS+CoAP channel with the stored credentials and sends
    /// `POST rd`. On 2.01 Created the registration location is kept; on
    /// timeout the connection is torn down and the update ticker retries
    /// on its next fire.
    pub fn register(&self) -> Result<()> {
        log::info!("registering with the management server");
        self.connect()?;
        self.register_over_current_connection()
    }

    pub(crate) fn register_over_current_connection(&self) -> Result<()> {
        let channel = self
            .channel()
            .ok_or_else(|| Error::Protocol("no open connection".to_string()))?;
        let lifetime = self.lifetime();
        let (message_id, completion) = channel.send_request(
            Code::Post,
            self.register_options(lifetime),
            self.register_link_format(),
        )?;
        match completion.recv_timeout(REGISTER_TIMEOUT) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.registered = true;
                log::info!("register finished, location {}", state.location);
                Ok(())
            }
            Err(_) => {
                channel.forget(message_id);
                self.disconnect();
                Err(Error::Timeout("register"))
            }
        }
    }

    /// Refreshes the registration with `POST rd/<location>`; falls back
    /// to a full Register when no connection is open.
    pub fn update(&self) -> Result<()> {
        let channel = match self.channel() {
            Some(channel) => channel,
            None => return self.register(),
        };
        log::info!("updating registration");
        let options = {
            let state = self.state.lock();
            vec![
                Opt::new(OPTION_URI_PATH, "rd"),
                Opt::new(OPTION_URI_PATH, state.location.as_bytes()),
            ]
        };
        let (message_id, completion) =
            channel.send_request(Code::Post, options, Vec::new())?;
        match completion.recv_timeout(UPDATE_TIMEOUT) {
            Ok(()) => {
                log::info!("update finished");
                Ok(())
            }
            Err(_) => {
                channel.forget(message_id);
                self.disconnect();
                Err(Error::Timeout("update"))
            }
        }
    }

    /// Stores the registration handle: the second Location-Path segment
    /// of the 2.01 response (the first is `rd`).
    pub(crate) fn register_done(&self, message: &Message) {
        let segment = message
            .options
            .iter()
            .filter(|o| o.number == OPTION_LOCATION_PATH)
            .nth(1);
        if let Some(segment) = segment {
            self.state.lock().location =
                String::from_utf8_lossy(&segment.value).into_owned();
        }
    }

    fn connect(&self) -> Result<()> {
        let identity = self.identity();
        let psk = self.secret_key();
        let uri = self.server_uri().ok_or_else(|| {
            Error::Config("server URI resource is unreadable".to_string())
        })?;
        let host = uri.strip_prefix("coaps://").unwrap_or(&uri).to_string();

        // A lingering connection is replaced, not reused.
        self.disconnect();
        let connection = Dtls::connect(&host, &identity, &psk)
            .map_err(|err| {
                log::error!("DTLS connection failed: {}", err);
                err
            })?;
        self.attach(Box::new(connection));
        Ok(())
    }

    /// Wires a transport into a fresh CoAP channel whose receiver
    /// dispatches back into this agent.
    pub(crate) fn attach(&self, transport: Box<dyn Transport>) {
        let dispatcher = self.clone();
        let channel = Channel::open(
            transport,
            Arc::new(move |message| dispatcher.receive(message)),
        );
        self.state.lock().connection = Some(Arc::new(channel));
    }

    /// Closes the connection, if any, and clears the registration flag.
    pub fn disconnect(&self) {
        let connection = {
            let mut state = self.state.lock();
            state.registered = false;
            state.connection.take()
        };
        if let Some(channel) = connection {
            channel.close();
        }
    }

    fn register_options(&self, lifetime: u64) -> Vec<Opt> {
        vec![
            Opt::new(OPTION_URI_PATH, "rd"),
            Opt::new(OPTION_CONTENT_FORMAT, [CONTENT_FORMAT_LINK as u8]),
            Opt::new(OPTION_URI_QUERY, format!("lwm2m={}", LWM2M_VERSION)),
            Opt::new(OPTION_URI_QUERY, format!("ep={}", self.endpoint_name)),
            Opt::new(OPTION_URI_QUERY, format!("b={}", BINDING_MODE)),
            Opt::new(OPTION_URI_QUERY, format!("lt={}", lifetime)),
        ]
    }

    /// RFC 6690 link-format enumeration of every registered instance.
    /// The security object stays out of the list (OMA LwM2M 1.0 §5.3.1).
    fn register_link_format(&self) -> Vec<u8> {
        let mut out = format!(
            "</>;rt=\"oma.lwm2m\";ct={}",
            CONTENT_FORMAT_LWM2M_JSON
        );
        for path in self.instance_paths() {
            out.push_str(&format!(",<{}>", path));
        }
        out.into_bytes()
    }

    fn instance_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let (objects, code) = self.handler.list_object_ids();
        if code != Code::Content {
            return paths;
        }
        for object_id in objects {
            if object_id == OBJECT_SECURITY {
                continue;
            }
            let (instances, code) =
                self.handler.list_instance_ids(&self.object(object_id));
            if code != Code::Content {
                continue;
            }
            for instance_id in instances {
                paths.push(format!("/{}/{}", object_id, instance_id));
            }
        }
        paths
    }

    /// PSK identity: base64 at rest, raw bytes on the wire.
    pub(crate) fn identity(&self) -> Vec<u8> {
        self.read_value(
            OBJECT_SECURITY,
            self.security_instance,
            RESOURCE_SECURITY_IDENTITY,
        )
        .and_then(|value| BASE64.decode(value).ok())
        .unwrap_or_default()
    }

    /// PSK key: base64 at rest, raw bytes on the wire.
    pub(crate) fn secret_key(&self) -> Vec<u8> {
        self.read_value(
            OBJECT_SECURITY,
            self.security_instance,
            RESOURCE_SECURITY_SECRET_KEY,
        )
        .and_then(|value| BASE64.decode(value).ok())
        .unwrap_or_default()
    }

    fn server_uri(&self) -> Option<String> {
        self.read_value(
            OBJECT_SECURITY,
            self.security_instance,
            RESOURCE_SECURITY_URI,
        )
    }

    /// Registration lifetime in seconds; 60 when unreadable.
    pub(crate) fn lifetime(&self) -> u64 {
        self.read_value(
            OBJECT_SERVER,
            self.server_instance,
            RESOURCE_SERVER_LIFETIME,
        )
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_LIFETIME)
    }
}
