//! Data model shared between the gatehouse runtime and the modules it loads:
//! the broker message type with its wire codec, and the versioned module API
//! table that every loadable module exposes through a single discovery symbol.

pub mod api;
pub mod message;

pub use crate::api::{
    ApiError, BrokerHandle, MessageHandle, ModuleApi, ModuleGetApiFn, ModuleHandle,
    GATEWAY_API_VERSION, GET_API_SYMBOL,
};
pub use crate::message::{Message, MessageError};
