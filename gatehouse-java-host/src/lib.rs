//! The Java binding library for the gatehouse gateway.
//!
//! Built as a cdylib (`libgatehouse_java_host.so`), this is the library the
//! Java module loader opens. It exports the module discovery symbol, whose
//! API table hosts modules inside the embedded JVM, and the JNI entry point
//! the Java-side `Broker` object publishes back through.
//!
//! The host configuration crosses the dlopen boundary as JSON through the
//! table's configuration entries; nothing but `repr(C)` data and opaque
//! pointers is interpreted on both sides of that boundary.

use gatehouse_module::{
    BrokerHandle, Message, MessageHandle, ModuleApi, ModuleHandle, GATEWAY_API_VERSION,
};
use gatehouse_runtime_internals::host::{
    publish_from_java, JavaHostConfig, JavaModuleHandle, JavaModuleHost,
};
use jni_sys::{jbyteArray, jint, jlong, jobject, JNIEnv};
use lazy_static::lazy_static;
use libc::{c_char, c_void};
use std::ffi::CStr;
use std::ptr;

lazy_static! {
    // one host (and one manager behind it) per binding library instance; the
    // C vtable has no argument to thread an owner through
    static ref HOST: JavaModuleHost = JavaModuleHost::new();
}

unsafe extern "C" fn parse_configuration_from_json(json: *const c_char) -> *mut c_void {
    if json.is_null() {
        tracing::error!("configuration JSON is null");
        return ptr::null_mut();
    }
    let json = match CStr::from_ptr(json).to_str() {
        Ok(json) => json,
        Err(_) => {
            tracing::error!("configuration JSON is not valid UTF-8");
            return ptr::null_mut();
        }
    };
    match serde_json::from_str::<JavaHostConfig>(json) {
        Ok(config) => Box::into_raw(Box::new(config)) as *mut c_void,
        Err(e) => {
            tracing::error!("host configuration could not be parsed: {}", e);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn free_configuration(configuration: *mut c_void) {
    if !configuration.is_null() {
        drop(Box::from_raw(configuration as *mut JavaHostConfig));
    }
}

unsafe extern "C" fn create(
    broker: *mut BrokerHandle,
    configuration: *const c_void,
) -> *mut ModuleHandle {
    if configuration.is_null() {
        tracing::error!("create called with a null configuration");
        return ptr::null_mut();
    }
    let config = &*(configuration as *const JavaHostConfig);
    match HOST.create(broker, config) {
        Ok(handle) => Box::into_raw(handle) as *mut ModuleHandle,
        Err(e) => {
            tracing::error!("Java module could not be created: {}", e);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn destroy(module: *mut ModuleHandle) {
    if module.is_null() {
        return;
    }
    HOST.destroy(Box::from_raw(module as *mut JavaModuleHandle));
}

unsafe extern "C" fn receive(module: *mut ModuleHandle, message: *const MessageHandle) {
    if module.is_null() || message.is_null() {
        return;
    }
    let handle = &*(module as *const JavaModuleHandle);
    let message = &*(message as *const Message);
    HOST.receive(handle, message);
}

static JAVA_MODULE_API: ModuleApi = ModuleApi {
    version: GATEWAY_API_VERSION,
    parse_configuration_from_json: Some(parse_configuration_from_json),
    free_configuration: Some(free_configuration),
    create: Some(create),
    destroy: Some(destroy),
    receive: Some(receive),
};

/// The module discovery symbol.
///
/// Returns the Java host's API table when the calling gateway supports this
/// binding's version, and null otherwise.
#[no_mangle]
pub extern "C" fn gatehouse_module_get_api(gateway_api_version: u32) -> *const ModuleApi {
    if gateway_api_version < JAVA_MODULE_API.version {
        tracing::error!(
            "gateway api version {} is below this binding's version {}",
            gateway_api_version,
            JAVA_MODULE_API.version
        );
        return ptr::null();
    }
    &JAVA_MODULE_API
}

/// Native method behind `com.gatehouse.core.Broker#publishMessage(long, long, byte[])`.
///
/// The broker and module pointers arrive as the opaque longs the Java side
/// has carried since module construction; they are never dereferenced over
/// there. Returns 0 on success and nonzero on any failure.
#[no_mangle]
pub unsafe extern "system" fn Java_com_gatehouse_core_Broker_publishMessage(
    env: *mut JNIEnv,
    _this: jobject,
    broker_addr: jlong,
    module_addr: jlong,
    serialized: jbyteArray,
) -> jint {
    publish_from_java(env, broker_addr, module_addr, serialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_runtime_internals::host::JvmOptions;
    use std::ffi::CString;

    fn config() -> JavaHostConfig {
        JavaHostConfig {
            class_name: "com.example.Sensor".to_owned(),
            configuration_json: Some(r#"{"interval":5}"#.to_owned()),
            options: JvmOptions {
                class_path: "/opt/gatehouse/bindings".to_owned(),
                library_path: "/opt/gatehouse/modules".to_owned(),
                version: 8,
                debug: false,
                debug_port: 0,
                verbose: false,
                additional_options: vec![],
            },
        }
    }

    #[test]
    fn api_table_is_complete() {
        JAVA_MODULE_API
            .validate(GATEWAY_API_VERSION)
            .expect("the binding's table is valid");
    }

    #[test]
    fn get_api_rejects_older_gateways() {
        assert!(gatehouse_module_get_api(0).is_null());

        let api = gatehouse_module_get_api(GATEWAY_API_VERSION);
        assert!(!api.is_null());
        assert_eq!(unsafe { (*api).version }, GATEWAY_API_VERSION);
    }

    #[test]
    fn configuration_round_trips_through_the_shims() {
        let config = config();
        let json = CString::new(serde_json::to_string(&config).unwrap()).unwrap();

        let parsed = unsafe { parse_configuration_from_json(json.as_ptr()) };
        assert!(!parsed.is_null());
        assert_eq!(unsafe { &*(parsed as *const JavaHostConfig) }, &config);
        unsafe { free_configuration(parsed) };
    }

    #[test]
    fn bad_configuration_is_rejected() {
        let not_json = CString::new("not a configuration").unwrap();
        assert!(unsafe { parse_configuration_from_json(not_json.as_ptr()) }.is_null());
        assert!(unsafe { parse_configuration_from_json(ptr::null()) }.is_null());
    }

    #[test]
    fn create_with_null_arguments_fails_cleanly() {
        assert!(unsafe { create(0x10 as *mut BrokerHandle, ptr::null()) }.is_null());

        // a null broker is caught by the host before any runtime work
        let config = config();
        assert!(unsafe {
            create(
                ptr::null_mut(),
                &config as *const JavaHostConfig as *const c_void,
            )
        }
        .is_null());
    }

    #[test]
    fn destroy_and_receive_ignore_null_handles() {
        unsafe { destroy(ptr::null_mut()) };
        unsafe { receive(ptr::null_mut(), ptr::null()) };
        unsafe { free_configuration(ptr::null_mut()) };
    }
}
