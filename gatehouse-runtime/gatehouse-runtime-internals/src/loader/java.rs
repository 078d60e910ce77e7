use crate::dylib::SharedLibrary;
use crate::error::Error;
use crate::host::{JavaHostConfig, JvmOptions};
use crate::loader::{BaseLoaderConfig, LoadedModule, ModuleLoader};
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
const BINDING_MODULE_NAME: &str = "gatehouse_java_host.dll";
#[cfg(target_os = "macos")]
const BINDING_MODULE_NAME: &str = "libgatehouse_java_host.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const BINDING_MODULE_NAME: &str = "libgatehouse_java_host.so";

const INSTALL_NAME: &str = "gatehouse";
const INSTALL_VERSION: &str = env!("CARGO_PKG_VERSION");
const BINDINGS_INSTALL_DIR: &str = "bindings";
const MODULES_INSTALL_DIR: &str = "modules";

/// Environment variables naming installation roots to search for the binding
/// library, in order.
const ENV_VARS: &[&str] = &["GATEHOUSE_HOME"];

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

#[cfg(unix)]
fn install_prefix() -> Result<PathBuf, Error> {
    Ok(PathBuf::from("/usr/local"))
}

#[cfg(windows)]
fn install_prefix() -> Result<PathBuf, Error> {
    env::var("ProgramFiles").map(PathBuf::from).map_err(|_| {
        Error::LoaderConfig("could not resolve the installation prefix".to_owned())
    })
}

#[cfg(unix)]
fn fallback_prefixes() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/local"), PathBuf::from("/usr")]
}

#[cfg(windows)]
fn fallback_prefixes() -> Vec<PathBuf> {
    install_prefix().map(|p| vec![p]).unwrap_or_default()
}

fn install_root(prefix: &Path) -> PathBuf {
    prefix.join(format!("{}-{}", INSTALL_NAME, INSTALL_VERSION))
}

fn default_bindings_path() -> Result<PathBuf, Error> {
    Ok(install_root(&install_prefix()?).join(BINDINGS_INSTALL_DIR))
}

fn default_modules_path() -> Result<PathBuf, Error> {
    Ok(install_root(&install_prefix()?).join(MODULES_INSTALL_DIR))
}

/// Loader-level configuration: the shared runtime options plus an optional
/// override of where the binding library lives.
#[derive(Clone, Debug, PartialEq)]
pub struct JavaLoaderConfig {
    pub base: BaseLoaderConfig,
    pub options: JvmOptions,
}

impl JavaLoaderConfig {
    /// The configuration used when the gateway supplies none: installation
    /// paths, no debugging, the launcher's default JNI version.
    pub fn with_defaults() -> Result<Self, Error> {
        Ok(JavaLoaderConfig {
            base: BaseLoaderConfig::default(),
            options: RawJvmOptions::default().resolve()?,
        })
    }

    /// Parse the loader configuration JSON: a `binding.path` override plus a
    /// nested `jvm.options` object. Missing paths fall back to the
    /// installation defaults; everything else to zero/false/empty.
    pub fn from_json(json: &Value) -> Result<Self, Error> {
        let base = BaseLoaderConfig::from_json(json)?;
        let raw: RawJvmOptions = match json.get("jvm.options") {
            Some(options) => serde_json::from_value(options.clone())?,
            None => RawJvmOptions::default(),
        };
        Ok(JavaLoaderConfig {
            base,
            options: raw.resolve()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawJvmOptions {
    classpath: Option<String>,
    librarypath: Option<String>,
    version: Option<i32>,
    debug: Option<bool>,
    debugport: Option<u16>,
    verbose: Option<bool>,
    additionaloptions: Option<Vec<String>>,
}

impl RawJvmOptions {
    fn resolve(self) -> Result<JvmOptions, Error> {
        // paths are always populated; a prefix that cannot be resolved is a
        // hard error, not an empty default
        let class_path = match self.classpath {
            Some(path) => path,
            None => default_bindings_path()?.to_string_lossy().into_owned(),
        };
        let library_path = match self.librarypath {
            Some(path) => path,
            None => default_modules_path()?.to_string_lossy().into_owned(),
        };
        Ok(JvmOptions {
            class_path,
            library_path,
            version: self.version.unwrap_or(0),
            debug: self.debug.unwrap_or(false),
            debug_port: self.debugport.unwrap_or(0),
            verbose: self.verbose.unwrap_or(false),
            additional_options: self.additionaloptions.unwrap_or_default(),
        })
    }
}

/// Addressing information for one Java module: the class to instantiate and
/// the classpath fragment its classes live on.
#[derive(Clone, Debug, PartialEq)]
pub struct JavaEntrypoint {
    pub class_name: String,
    pub class_path: String,
}

/// Loads the Java binding library and builds the host configuration each
/// Java module is created with.
pub struct JavaLoader {
    config: JavaLoaderConfig,
}

impl JavaLoader {
    pub fn new() -> Result<Self, Error> {
        Ok(JavaLoader {
            config: JavaLoaderConfig::with_defaults()?,
        })
    }

    pub fn with_config(config: JavaLoaderConfig) -> Self {
        JavaLoader { config }
    }

    pub fn config(&self) -> &JavaLoaderConfig {
        &self.config
    }

    /// Locate and open the binding library.
    ///
    /// An explicit `binding.path` is used as-is. Otherwise the compiled-in
    /// name is tried first (which honors the platform's library search path),
    /// then installation roots named by environment variables, then the fixed
    /// installation prefixes.
    fn load_binding_library(&self) -> Result<SharedLibrary, Error> {
        if let Some(path) = &self.config.base.binding_path {
            return SharedLibrary::load(path);
        }

        match SharedLibrary::load(BINDING_MODULE_NAME) {
            Ok(lib) => Ok(lib),
            Err(first_err) => {
                for root in binding_search_roots() {
                    let candidate = install_root(&root)
                        .join(MODULES_INSTALL_DIR)
                        .join(BINDING_MODULE_NAME);
                    tracing::info!(
                        "searching for the Java binding library at {}",
                        candidate.display()
                    );
                    if let Ok(lib) = SharedLibrary::load(&candidate) {
                        return Ok(lib);
                    }
                }
                tracing::error!("the Java binding library could not be located");
                Err(first_err)
            }
        }
    }
}

fn binding_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for var in ENV_VARS {
        if let Ok(value) = env::var(var) {
            roots.push(PathBuf::from(value));
        }
    }
    roots.extend(fallback_prefixes());
    roots
}

impl ModuleLoader for JavaLoader {
    type Entrypoint = JavaEntrypoint;
    type ModuleConfig = JavaHostConfig;

    fn name(&self) -> &'static str {
        "java"
    }

    fn parse_entrypoint(&self, json: &Value) -> Result<JavaEntrypoint, Error> {
        let class_name = json
            .get("class.name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::LoaderConfig("entrypoint is missing the `class.name` string".to_owned())
            })?;
        let class_path = json
            .get("class.path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::LoaderConfig("entrypoint is missing the `class.path` string".to_owned())
            })?;
        Ok(JavaEntrypoint {
            class_name: class_name.to_owned(),
            class_path: class_path.to_owned(),
        })
    }

    fn load(&self, _entrypoint: &JavaEntrypoint) -> Result<LoadedModule, Error> {
        let library = self.load_binding_library()?;
        LoadedModule::from_library(library)
    }

    /// Merge the entrypoint, the module's own configuration, and the loader's
    /// runtime options into the host configuration.
    ///
    /// The module's classpath fragment is appended to the loader-level
    /// classpath (loader first), so a module's own classes resolve alongside
    /// the shared ones.
    fn build_module_configuration(
        &self,
        entrypoint: &JavaEntrypoint,
        module_config: Option<&str>,
    ) -> Result<JavaHostConfig, Error> {
        if entrypoint.class_name.is_empty() {
            return Err(Error::InvalidArgument("entrypoint class name is empty"));
        }

        let mut options = self.config.options.clone();
        options.class_path = format!(
            "{}{}{}",
            options.class_path, PATH_SEPARATOR, entrypoint.class_path
        );

        Ok(JavaHostConfig {
            class_name: entrypoint.class_name.clone(),
            configuration_json: module_config.map(str::to_owned),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loader_with(options: JvmOptions) -> JavaLoader {
        JavaLoader::with_config(JavaLoaderConfig {
            base: BaseLoaderConfig::default(),
            options,
        })
    }

    fn options() -> JvmOptions {
        JvmOptions {
            class_path: "/shared/bindings".to_owned(),
            library_path: "/shared/modules".to_owned(),
            version: 8,
            debug: false,
            debug_port: 0,
            verbose: false,
            additional_options: vec![],
        }
    }

    #[test]
    fn entrypoint_requires_both_fields() {
        let loader = loader_with(options());
        assert!(loader
            .parse_entrypoint(&json!({ "class.name": "com.example.Foo" }))
            .is_err());
        assert!(loader
            .parse_entrypoint(&json!({ "class.path": "/opt/foo.jar" }))
            .is_err());

        let ep = loader
            .parse_entrypoint(&json!({
                "class.name": "com.example.Foo",
                "class.path": "/opt/foo.jar",
            }))
            .expect("parses");
        assert_eq!(ep.class_name, "com.example.Foo");
        assert_eq!(ep.class_path, "/opt/foo.jar");
    }

    #[test]
    fn configuration_defaults_to_installation_paths() {
        let config = JavaLoaderConfig::from_json(&json!({})).expect("parses");
        let expected = format!("gatehouse-{}", INSTALL_VERSION);
        assert!(config.options.class_path.contains(&expected));
        assert!(config.options.class_path.ends_with(BINDINGS_INSTALL_DIR));
        assert!(config.options.library_path.ends_with(MODULES_INSTALL_DIR));
        assert_eq!(config.options.version, 0);
        assert!(!config.options.debug);
        assert!(config.options.additional_options.is_empty());
        assert_eq!(config.base.binding_path, None);
    }

    #[test]
    fn configuration_parses_all_fields() {
        let config = JavaLoaderConfig::from_json(&json!({
            "binding.path": "/opt/bindings/libgatehouse_java_host.so",
            "jvm.options": {
                "classpath": "/cp",
                "librarypath": "/lp",
                "version": 8,
                "debug": true,
                "debugport": 5005,
                "verbose": true,
                "additionaloptions": ["-Xmx512m"],
            }
        }))
        .expect("parses");
        assert_eq!(
            config.base.binding_path.as_deref(),
            Some(Path::new("/opt/bindings/libgatehouse_java_host.so"))
        );
        assert_eq!(config.options.class_path, "/cp");
        assert_eq!(config.options.library_path, "/lp");
        assert_eq!(config.options.version, 8);
        assert!(config.options.debug);
        assert_eq!(config.options.debug_port, 5005);
        assert!(config.options.verbose);
        assert_eq!(config.options.additional_options, vec!["-Xmx512m"]);
    }

    #[test]
    fn module_classpath_appended_after_loader_classpath() {
        let loader = loader_with(options());
        let ep = JavaEntrypoint {
            class_name: "com.example.Foo".to_owned(),
            class_path: "/opt/foo.jar".to_owned(),
        };
        let config = loader
            .build_module_configuration(&ep, Some(r#"{"interval":5}"#))
            .expect("builds");

        assert_eq!(config.class_name, "com.example.Foo");
        assert_eq!(
            config.options.class_path,
            format!("/shared/bindings{}/opt/foo.jar", PATH_SEPARATOR)
        );
        assert_eq!(config.configuration_json.as_deref(), Some(r#"{"interval":5}"#));
        // the loader's own options are untouched
        assert_eq!(loader.config().options.class_path, "/shared/bindings");
    }

    #[test]
    fn empty_class_name_rejected() {
        let loader = loader_with(options());
        let ep = JavaEntrypoint {
            class_name: String::new(),
            class_path: "/opt/foo.jar".to_owned(),
        };
        assert!(loader.build_module_configuration(&ep, None).is_err());
    }

    #[test]
    fn missing_binding_library_fails_load() {
        let mut config = JavaLoaderConfig {
            base: BaseLoaderConfig::default(),
            options: options(),
        };
        config.base.binding_path =
            Some(PathBuf::from("/nonexistent/libgatehouse_java_host.so"));
        let loader = JavaLoader::with_config(config);
        let ep = JavaEntrypoint {
            class_name: "com.example.Foo".to_owned(),
            class_path: "/opt/foo.jar".to_owned(),
        };
        assert!(matches!(loader.load(&ep), Err(Error::DlError(_))));
    }

    #[test]
    fn env_var_roots_precede_installation_prefixes() {
        env::set_var("GATEHOUSE_HOME", "/custom/root");
        let roots = binding_search_roots();
        env::remove_var("GATEHOUSE_HOME");

        assert_eq!(roots[0], PathBuf::from("/custom/root"));
        assert!(roots.len() > 1);
    }
}
