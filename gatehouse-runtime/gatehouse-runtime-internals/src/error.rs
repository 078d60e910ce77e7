use anyhow::Error as AnyError;
use gatehouse_module::{ApiError, MessageError};
use thiserror::Error;

/// Gatehouse runtime errors.
///
/// Nothing here crosses an FFI boundary as an unwind; the ABI shims translate
/// every variant into a null pointer or a nonzero status at the edge.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {}", _0)]
    InvalidArgument(&'static str),

    /// IO errors arising while loading or resolving symbols in a shared
    /// library.
    #[error("Dynamic loading error: {}", _0)]
    DlError(#[from] libloading::Error),

    /// A loaded library is not a usable gatehouse module.
    #[error("Incorrect module: {}", _0)]
    IncorrectModule(String),

    #[error("Module api error: {}", _0)]
    ModuleApi(#[from] ApiError),

    #[error("Loader configuration error: {}", _0)]
    LoaderConfig(String),

    #[error("Configuration parse error: {}", _0)]
    Json(#[from] serde_json::Error),

    #[error("Message error: {}", _0)]
    Message(#[from] MessageError),

    /// The embedded runtime could not be created or found.
    #[error("Runtime launch failed: {}", _0)]
    RuntimeLaunch(String),

    /// A JNI call returned a failure status.
    #[error("JNI call `{}` failed with status {}", _0, _1)]
    Jni(&'static str, i32),

    /// An exception was raised inside the embedded runtime. The exception has
    /// already been described and cleared by the time this is returned.
    #[error("Exception raised in the embedded runtime during {}", _0)]
    JavaException(&'static str),

    /// A second module asked for an embedded runtime with different options
    /// than the one already running.
    #[error("Embedded runtime configuration does not match the running runtime")]
    ConfigMismatch,

    /// The host manager has no active runtime to operate on.
    #[error("No embedded runtime is active")]
    ManagerEmpty,

    /// More module detaches than attaches; a caller bug.
    #[error("Module reference count underflow")]
    RefcountUnderflow,

    #[error("Publish rejected by the broker")]
    PublishRejected,

    /// A catch-all for internal errors that are likely unrecoverable by the
    /// runtime user.
    #[error("Internal error: {}", _0)]
    InternalError(#[source] AnyError),
}

#[macro_export]
macro_rules! incorrect_module {
    ($($arg:tt)*) => {
        $crate::error::Error::IncorrectModule(format!($($arg)*))
    };
}
