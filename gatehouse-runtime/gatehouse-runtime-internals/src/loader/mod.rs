//! The module loader protocol and its implementations.
//!
//! A loader turns loader-specific addressing information (a library path, a
//! class name plus classpath) into a validated module API table the gateway
//! can drive. Loaders that host modules in a foreign runtime additionally
//! build the per-module host configuration the binding library consumes.

mod java;
mod native;

pub use crate::loader::java::{JavaEntrypoint, JavaLoader, JavaLoaderConfig};
pub use crate::loader::native::{NativeEntrypoint, NativeLoader};

use crate::dylib::SharedLibrary;
use crate::error::Error;
use gatehouse_module::{ModuleApi, ModuleGetApiFn, GATEWAY_API_VERSION, GET_API_SYMBOL};
use serde_json::Value;
use std::path::PathBuf;

/// The capability set every module loader implements.
///
/// The entrypoint is parsed once at module-registration time and consumed by
/// `load`; loaders that need it longer copy what they need. Module
/// configuration built by `build_module_configuration` is owned by the caller
/// and freed by dropping it.
pub trait ModuleLoader {
    /// Loader-specific addressing information for a single module.
    type Entrypoint;

    /// The per-module configuration this loader hands to the module's
    /// `create`.
    type ModuleConfig;

    fn name(&self) -> &'static str;

    fn parse_entrypoint(&self, json: &Value) -> Result<Self::Entrypoint, Error>;

    fn load(&self, entrypoint: &Self::Entrypoint) -> Result<LoadedModule, Error>;

    fn build_module_configuration(
        &self,
        entrypoint: &Self::Entrypoint,
        module_config: Option<&str>,
    ) -> Result<Self::ModuleConfig, Error>;
}

/// Configuration shared by all loaders: an optional override for the library
/// the loader would otherwise locate on its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BaseLoaderConfig {
    pub binding_path: Option<PathBuf>,
}

impl BaseLoaderConfig {
    pub fn from_json(json: &Value) -> Result<Self, Error> {
        let binding_path = match json.get("binding.path") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(PathBuf::from(s)),
            Some(other) => {
                return Err(Error::LoaderConfig(format!(
                    "`binding.path` must be a string, got {}",
                    other
                )));
            }
        };
        Ok(BaseLoaderConfig { binding_path })
    }
}

/// A module library that has been loaded and whose API table has been
/// resolved and validated.
///
/// The table is copied out of the library, but its function pointers point
/// into it, so the library stays open for as long as this value lives.
/// Dropping a `LoadedModule` unloads the library.
pub struct LoadedModule {
    _library: SharedLibrary,
    api: ModuleApi,
}

impl LoadedModule {
    /// Resolve the discovery symbol in `library`, invoke it with the
    /// gateway's supported API version, and validate the returned table.
    ///
    /// `library` is consumed; every failure path drops it, so a half-loaded
    /// module never leaves an OS handle behind.
    pub(crate) fn from_library(library: SharedLibrary) -> Result<Self, Error> {
        let get_api = unsafe { library.symbol::<ModuleGetApiFn>(GET_API_SYMBOL)? };
        let api_ptr = unsafe { get_api(GATEWAY_API_VERSION) };
        if api_ptr.is_null() {
            return Err(incorrect_module!(
                "`{}` returned a null api table ({})",
                String::from_utf8_lossy(GET_API_SYMBOL),
                library.path().display()
            ));
        }
        let api = unsafe { *api_ptr };
        api.validate(GATEWAY_API_VERSION)?;
        drop(get_api);
        Ok(LoadedModule {
            _library: library,
            api,
        })
    }

    pub fn api(&self) -> &ModuleApi {
        &self.api
    }

    /// Release the library. Equivalent to dropping, provided for call sites
    /// that want the unload to be visible in the source.
    pub fn unload(self) {}
}
