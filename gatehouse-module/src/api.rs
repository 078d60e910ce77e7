use libc::{c_char, c_void};
use thiserror::Error;

/// The highest module API version this gateway understands. A module
/// advertising a greater version is rejected at load time.
pub const GATEWAY_API_VERSION: u32 = 1;

/// Name of the discovery symbol every loadable module (or binding library)
/// must export.
pub const GET_API_SYMBOL: &[u8] = b"gatehouse_module_get_api";

/// Marker type for the broker pointer handed to a module's `create`.
///
/// Modules treat this as opaque; it round-trips through foreign runtimes as a
/// plain integer and is only ever dereferenced by the gateway itself.
#[repr(C)]
pub struct BrokerHandle {
    _unused: [u8; 0],
}

/// Marker type for a created module instance.
#[repr(C)]
pub struct ModuleHandle {
    _unused: [u8; 0],
}

/// Marker type for a message crossing the module ABI.
#[repr(C)]
pub struct MessageHandle {
    _unused: [u8; 0],
}

pub type ModuleGetApiFn = unsafe extern "C" fn(gateway_api_version: u32) -> *const ModuleApi;

pub type ModuleParseConfigurationFn = unsafe extern "C" fn(json: *const c_char) -> *mut c_void;
pub type ModuleFreeConfigurationFn = unsafe extern "C" fn(configuration: *mut c_void);
pub type ModuleCreateFn = unsafe extern "C" fn(
    broker: *mut BrokerHandle,
    configuration: *const c_void,
) -> *mut ModuleHandle;
pub type ModuleDestroyFn = unsafe extern "C" fn(module: *mut ModuleHandle);
pub type ModuleReceiveFn =
    unsafe extern "C" fn(module: *mut ModuleHandle, message: *const MessageHandle);

/// The version-tagged function table a module exposes through
/// [`GET_API_SYMBOL`].
///
/// The configuration entries are optional; `create`, `destroy`, and `receive`
/// must all be present for the table to be usable, which
/// [`validate`](ModuleApi::validate) checks once at load time so call sites
/// never need to.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModuleApi {
    pub version: u32,
    pub parse_configuration_from_json: Option<ModuleParseConfigurationFn>,
    pub free_configuration: Option<ModuleFreeConfigurationFn>,
    pub create: Option<ModuleCreateFn>,
    pub destroy: Option<ModuleDestroyFn>,
    pub receive: Option<ModuleReceiveFn>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("module api version {module} exceeds the gateway's supported version {supported}")]
    VersionMismatch { module: u32, supported: u32 },

    #[error("module api table is missing its `{0}` entry")]
    MissingEntry(&'static str),
}

impl ModuleApi {
    /// Check that this table can be driven by a gateway supporting versions up
    /// to `supported`.
    pub fn validate(&self, supported: u32) -> Result<(), ApiError> {
        if self.version > supported {
            return Err(ApiError::VersionMismatch {
                module: self.version,
                supported,
            });
        }
        if self.create.is_none() {
            return Err(ApiError::MissingEntry("create"));
        }
        if self.destroy.is_none() {
            return Err(ApiError::MissingEntry("destroy"));
        }
        if self.receive.is_none() {
            return Err(ApiError::MissingEntry("receive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn create(
        _broker: *mut BrokerHandle,
        _configuration: *const c_void,
    ) -> *mut ModuleHandle {
        std::ptr::null_mut()
    }
    unsafe extern "C" fn destroy(_module: *mut ModuleHandle) {}
    unsafe extern "C" fn receive(_module: *mut ModuleHandle, _message: *const MessageHandle) {}

    fn complete() -> ModuleApi {
        ModuleApi {
            version: 1,
            parse_configuration_from_json: None,
            free_configuration: None,
            create: Some(create),
            destroy: Some(destroy),
            receive: Some(receive),
        }
    }

    #[test]
    fn complete_table_validates() {
        assert!(complete().validate(GATEWAY_API_VERSION).is_ok());
    }

    #[test]
    fn future_version_rejected() {
        let mut api = complete();
        api.version = GATEWAY_API_VERSION + 1;
        assert!(matches!(
            api.validate(GATEWAY_API_VERSION),
            Err(ApiError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn missing_lifecycle_entry_rejected() {
        for entry in &["create", "destroy", "receive"] {
            let mut api = complete();
            match *entry {
                "create" => api.create = None,
                "destroy" => api.destroy = None,
                _ => api.receive = None,
            }
            match api.validate(GATEWAY_API_VERSION) {
                Err(ApiError::MissingEntry(name)) => assert_eq!(name, *entry),
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }
}
