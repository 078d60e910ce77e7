//! `gatehouse-runtime` loads independently built modules into a gateway
//! process and manages their lifecycles. Modules come from native shared
//! libraries or live inside an embedded Java virtual machine; either way they
//! are driven through the same three-entry API table and talk to the rest of
//! the gateway only by publishing messages to the broker.

#![deny(bare_trait_objects)]

#[macro_use]
pub mod error;

pub mod broker;
pub mod dylib;
pub mod host;
pub mod loader;
