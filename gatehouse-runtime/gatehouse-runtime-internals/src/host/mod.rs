//! Hosting for modules that live inside an embedded foreign runtime.
//!
//! The Java host is the exemplar: it owns the JVM's lifecycle through the
//! reference-counted [`HostManager`], marshals gateway messages into calls on
//! a runtime-hosted module object, and accepts publications back from the
//! runtime through an exported native entry point.

pub mod jvm;
pub mod manager;

pub use crate::host::jvm::{AttachGuard, Env, Jvm, JvmOptions};
pub use crate::host::manager::{EmbeddedRuntime, HostManager, RuntimeClaim};

use crate::broker::{with_broker, ModuleRef};
use crate::error::Error;
use gatehouse_module::{BrokerHandle, Message, ModuleHandle};
use jni_sys::{jbyteArray, jint, jlong, jvalue, JNIEnv};
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

const BROKER_CLASS_NAME: &[u8] = b"com/gatehouse/core/Broker\0";
const CONSTRUCTOR_NAME: &[u8] = b"<init>\0";
const BROKER_CTOR_SIG: &[u8] = b"(J)V\0";
const MODULE_CTOR_SIG: &[u8] = b"(JLcom/gatehouse/core/Broker;Ljava/lang/String;)V\0";
const DESTROY_NAME: &[u8] = b"destroy\0";
const DESTROY_SIG: &[u8] = b"()V\0";
const RECEIVE_NAME: &[u8] = b"receive\0";
const RECEIVE_SIG: &[u8] = b"([B)V\0";

fn sc(bytes: &'static [u8]) -> &'static CStr {
    CStr::from_bytes_with_nul(bytes).expect("static JNI name is NUL-terminated")
}

/// The resolved per-module configuration the Java loader builds and the host
/// consumes: which class to instantiate, the module's own configuration blob,
/// and the runtime options the JVM must be running with.
///
/// This is the value that crosses from the loader to the binding library, as
/// JSON, through the module API table's configuration entries.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JavaHostConfig {
    pub class_name: String,
    pub configuration_json: Option<String>,
    pub options: JvmOptions,
}

/// Per-module state: the runtime handle, the durable reference to the
/// runtime-hosted module object, and the claim that keeps the runtime alive.
pub struct JavaModuleHandle {
    jvm: Jvm,
    module_obj: jni_sys::jobject,
    /// The module's class name in JNI slash form.
    class_name: String,
    #[allow(dead_code)]
    broker: *mut BrokerHandle,
    // declared last: releasing the claim may destroy the JVM, which must not
    // happen before the global reference is gone
    claim: RuntimeClaim<Jvm, JvmOptions>,
}

// The global reference is usable from any attached thread; the gateway's
// contract excludes concurrent receive/destroy on one handle, so no
// per-handle lock is needed.
unsafe impl Send for JavaModuleHandle {}
unsafe impl Sync for JavaModuleHandle {}

/// The Java module host. One host (and one manager behind it) exists per
/// binding library instance; all Java modules in the process share it.
pub struct JavaModuleHost {
    manager: Arc<HostManager<Jvm, JvmOptions>>,
}

impl JavaModuleHost {
    pub fn new() -> Self {
        JavaModuleHost {
            manager: Arc::new(HostManager::new()),
        }
    }

    pub fn manager(&self) -> &Arc<HostManager<Jvm, JvmOptions>> {
        &self.manager
    }

    /// Create a module instance inside the embedded JVM.
    ///
    /// The first module to arrive boots the JVM (under the manager's lock);
    /// later modules attach to it, provided their runtime options match. The
    /// native handle's address is passed into the module object's constructor
    /// as an opaque `long`, so the handle is boxed before the constructor
    /// runs. Every failure after the runtime claim unwinds in reverse order:
    /// the attachment detaches, the claim releases, and a sole-user runtime
    /// is torn down again.
    pub fn create(
        &self,
        broker: *mut BrokerHandle,
        config: &JavaHostConfig,
    ) -> Result<Box<JavaModuleHandle>, Error> {
        if broker.is_null() {
            return Err(Error::InvalidArgument("broker is null"));
        }
        if config.class_name.is_empty() {
            return Err(Error::InvalidArgument("class_name is empty"));
        }

        let options = config.options.clone();
        let claim = self.manager.claim(&config.options, move || Jvm::launch(&options))?;
        let jvm = claim.runtime().clone();

        let mut handle = Box::new(JavaModuleHandle {
            jvm: jvm.clone(),
            module_obj: ptr::null_mut(),
            class_name: config.class_name.replace('.', "/"),
            broker,
            claim,
        });

        {
            let guard = jvm.attach()?;

            let broker_class = guard.find_class(sc(BROKER_CLASS_NAME))?;
            let broker_ctor =
                guard.method_id(broker_class, sc(CONSTRUCTOR_NAME), sc(BROKER_CTOR_SIG))?;
            let broker_obj =
                guard.new_object(broker_class, broker_ctor, &[jvalue { j: broker as jlong }])?;

            let module_class_name = CString::new(handle.class_name.clone())
                .map_err(|_| Error::InvalidArgument("class_name contains a NUL byte"))?;
            let module_class = guard.find_class(&module_class_name)?;
            let module_ctor =
                guard.method_id(module_class, sc(CONSTRUCTOR_NAME), sc(MODULE_CTOR_SIG))?;

            let config_json = CString::new(config.configuration_json.as_deref().unwrap_or("{}"))
                .map_err(|_| Error::InvalidArgument("configuration_json contains a NUL byte"))?;
            let config_string = guard.new_string(&config_json)?;

            let handle_ptr = &mut *handle as *mut JavaModuleHandle;
            let module_obj = guard.new_object(
                module_class,
                module_ctor,
                &[
                    jvalue {
                        j: handle_ptr as jlong,
                    },
                    jvalue { l: broker_obj },
                    jvalue { l: config_string },
                ],
            )?;

            handle.module_obj = guard.new_global_ref(module_obj)?;
        }

        Ok(handle)
    }

    /// Destroy a module instance.
    ///
    /// The module object's `destroy()` is invoked best-effort: an exception
    /// raised inside the runtime is logged and destruction proceeds. The
    /// durable reference is released, the thread detached, and the manager
    /// claim dropped; when this was the last Java module, the JVM itself is
    /// destroyed.
    pub fn destroy(&self, handle: Box<JavaModuleHandle>) {
        match handle.jvm.attach() {
            Ok(guard) => {
                let method = guard
                    .object_class(handle.module_obj)
                    .and_then(|class| guard.method_id(class, sc(DESTROY_NAME), sc(DESTROY_SIG)));
                match method {
                    Ok(method) => {
                        if let Err(e) =
                            guard.call_void(handle.module_obj, method, &[], "destroy()")
                        {
                            tracing::error!(
                                "exception in {}.destroy(); destruction continues: {}",
                                handle.class_name,
                                e
                            );
                        }
                    }
                    Err(e) => tracing::error!(
                        "could not resolve {}.destroy(); it will not be called: {}",
                        handle.class_name,
                        e
                    ),
                }
                guard.delete_global_ref(handle.module_obj);
            }
            Err(e) => tracing::error!(
                "could not attach to the JVM to destroy {}: {}",
                handle.class_name,
                e
            ),
        }
        // dropping the handle releases the manager claim; the last module
        // out also destroys the JVM
        drop(handle);
    }

    /// Deliver a message to the module object's `receive(byte[])`.
    ///
    /// The calling thread may be a broker-dispatch thread that has never
    /// touched the JVM, so the call is bracketed by its own attachment.
    /// Failures are logged, never propagated.
    pub fn receive(&self, handle: &JavaModuleHandle, message: &Message) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("could not serialize the message: {}", e);
                return;
            }
        };

        let guard = match handle.jvm.attach() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("could not attach to the JVM for receive: {}", e);
                return;
            }
        };

        let array = match guard.byte_array_from(&bytes) {
            Ok(array) => array,
            Err(e) => {
                tracing::error!("could not marshal the message into the JVM: {}", e);
                return;
            }
        };

        let result = guard
            .object_class(handle.module_obj)
            .and_then(|class| guard.method_id(class, sc(RECEIVE_NAME), sc(RECEIVE_SIG)))
            .and_then(|method| {
                guard.call_void(handle.module_obj, method, &[jvalue { l: array }], "receive(byte[])")
            });
        if let Err(e) = result {
            tracing::error!("receive failed for {}: {}", handle.class_name, e);
        }

        guard.delete_local_ref(array);
    }
}

impl Default for JavaModuleHost {
    fn default() -> Self {
        JavaModuleHost::new()
    }
}

/// The reverse direction: the runtime-hosted `Broker` object publishing back
/// into the gateway.
///
/// Called by the exported JNI symbol with the broker and module pointers the
/// runtime has been carrying as opaque `long`s. Returns 0 on success and
/// nonzero on any failure; the serialized bytes and the reconstructed
/// message are released on every path.
///
/// # Safety
///
/// `env` must be the live environment of the calling Java thread, and
/// `broker_addr` must be a pointer produced by
/// [`broker_into_raw`](crate::broker::broker_into_raw) that is still alive.
pub unsafe fn publish_from_java(
    env: *mut JNIEnv,
    broker_addr: jlong,
    module_addr: jlong,
    serialized: jbyteArray,
) -> jint {
    if env.is_null() || broker_addr == 0 || serialized.is_null() {
        tracing::error!(
            "invalid publish arguments (broker = {:#x}, serialized = {:?})",
            broker_addr,
            serialized
        );
        return 1;
    }

    let env = Env::from_raw(env);
    let bytes = match env.byte_array_to_vec(serialized) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("could not copy the serialized message out of the JVM: {}", e);
            return 1;
        }
    };

    let message = match Message::from_bytes(&bytes) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("message could not be reconstructed from its byte form: {}", e);
            return 1;
        }
    };

    let broker = broker_addr as usize as *mut BrokerHandle;
    let module = ModuleRef::from_raw(module_addr as usize as *mut ModuleHandle);
    match with_broker(broker, |b| b.publish(module, message)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("broker publish failed: {}", e);
            1
        }
    }
}
