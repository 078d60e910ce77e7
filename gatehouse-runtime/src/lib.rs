pub use gatehouse_module::{Message, MessageError, ModuleApi, GATEWAY_API_VERSION};
pub use gatehouse_runtime_internals::broker::{self, Broker, ModuleRef};
pub use gatehouse_runtime_internals::dylib::SharedLibrary;
pub use gatehouse_runtime_internals::error::Error;
pub use gatehouse_runtime_internals::host::{
    self, EmbeddedRuntime, HostManager, JavaHostConfig, JavaModuleHost, Jvm, JvmOptions,
    RuntimeClaim,
};
pub use gatehouse_runtime_internals::loader::{
    self, BaseLoaderConfig, JavaEntrypoint, JavaLoader, JavaLoaderConfig, LoadedModule,
    ModuleLoader, NativeEntrypoint, NativeLoader,
};
