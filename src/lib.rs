//! Device-side LwM2M 1.0 agent speaking CoAP over DTLS 1.2 with a
//! pre-shared key (`TLS_PSK_WITH_AES_128_CCM_8`).
//!
//! The crate owns the three protocol layers: the DTLS record and handshake
//! engine ([`dtls`]), the CoAP message layer ([`coap`]) and the LwM2M agent
//! itself ([`agent`]), including the TLV resource encoding ([`tlv`]).
//! Everything durable lives behind the [`model::Handler`] trait; the agent
//! only holds descriptors and protocol state.
//!
//! A caller wires things up roughly like this: load a [`Config`] and an
//! object catalogue, build an [`Agent`] over a `Handler`, optionally run
//! [`agent::bootstrap`] first to provision credentials, then spawn the
//! update and observe tickers and wait for a shutdown signal.

pub mod agent;
pub mod coap;
pub mod config;
pub mod dtls;
mod error;
pub mod model;
pub mod tlv;
pub mod transport;

pub use agent::Agent;
pub use config::Config;
pub use error::Error;

/// The result type for operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;
