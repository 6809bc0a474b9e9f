//! The CoAP message layer: wire codec and the request/response channel
//! with confirmable/acknowledgement correlation.

mod channel;
mod message;

pub use channel::{Channel, MessageHandler};
pub use message::{
    Code, Message, MessageType, Opt, CONTENT_FORMAT_LINK,
    CONTENT_FORMAT_LWM2M_JSON, CONTENT_FORMAT_LWM2M_TLV, OBSERVE_REGISTER,
    OPTION_CONTENT_FORMAT, OPTION_LOCATION_PATH, OPTION_OBSERVE,
    OPTION_URI_PATH, OPTION_URI_QUERY,
};
