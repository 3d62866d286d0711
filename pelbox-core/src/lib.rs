//! pelbox-core: Shared library for the pelbox locker controller
//!
//! This crate provides:
//! - Session authority backed by a Keycloak service credential
//! - Actuator drivers (Raspberry Pi GPIO or simulated)
//! - Sequence controller turning targets into timed motor pulses
//! - Device store (PostgreSQL or in-memory)
//! - Command gateway and HTTP wire types

pub mod actuator;
pub mod auth;
pub mod config;
pub mod device;
pub mod gateway;
pub mod keycloak;
pub mod protocol;
pub mod sequence;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use actuator::{Hardware, Journal};
pub use auth::{AuthError, Claims, SessionAuthority};
pub use config::Config;
pub use device::{DeviceState, DoorPosition};
pub use gateway::{CommandGateway, CommandReport, DeviceStatus, ErrorKind, GatewayError};
pub use keycloak::{IdentityProvider, KeycloakClient};
pub use protocol::CommandResponse;
pub use sequence::SequenceController;
pub use store::{DeviceStore, MemoryStore, PgStore};

/// Default HTTP port for pelbox-server
pub const DEFAULT_HTTP_PORT: u16 = 9002;
