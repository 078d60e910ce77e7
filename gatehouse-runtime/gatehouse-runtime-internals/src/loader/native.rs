use crate::dylib::SharedLibrary;
use crate::error::Error;
use crate::loader::{LoadedModule, ModuleLoader};
use serde_json::Value;
use std::path::PathBuf;

/// Loads modules from shared libraries on the filesystem.
///
/// No state beyond the protocol: the entrypoint names the library, the
/// library names its own API table, and the module's configuration JSON
/// passes through untouched.
#[derive(Debug, Default)]
pub struct NativeLoader;

#[derive(Clone, Debug, PartialEq)]
pub struct NativeEntrypoint {
    pub module_path: PathBuf,
}

impl ModuleLoader for NativeLoader {
    type Entrypoint = NativeEntrypoint;
    type ModuleConfig = Option<String>;

    fn name(&self) -> &'static str {
        "native"
    }

    fn parse_entrypoint(&self, json: &Value) -> Result<NativeEntrypoint, Error> {
        let module_path = json
            .get("module.path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::LoaderConfig("entrypoint is missing the `module.path` string".to_owned())
            })?;
        Ok(NativeEntrypoint {
            module_path: PathBuf::from(module_path),
        })
    }

    fn load(&self, entrypoint: &NativeEntrypoint) -> Result<LoadedModule, Error> {
        let library = SharedLibrary::load(&entrypoint.module_path)?;
        LoadedModule::from_library(library)
    }

    /// Native modules parse their own configuration; the gateway passes the
    /// JSON through verbatim.
    fn build_module_configuration(
        &self,
        _entrypoint: &NativeEntrypoint,
        module_config: Option<&str>,
    ) -> Result<Option<String>, Error> {
        Ok(module_config.map(str::to_owned))
    }
}
