use crate::dylib::SharedLibrary;
use crate::error::Error;
use crate::host::manager::EmbeddedRuntime;
use jni_sys::{
    jbyte, jbyteArray, jclass, jint, jmethodID, jobject, jsize, jstring, jvalue, JNIEnv,
    JNINativeInterface_, JavaVM, JavaVMInitArgs, JavaVMOption, JNI_EEXIST, JNI_EVERSION,
    JNI_FALSE, JNI_OK, JNI_VERSION_1_1, JNI_VERSION_1_2, JNI_VERSION_1_4, JNI_VERSION_1_6,
    JNI_VERSION_1_8,
};
use libc::{c_char, c_void};
use std::env;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

/// Options the embedded JVM is launched with.
///
/// One set of options exists per process; the host manager stores the set the
/// JVM was actually created with and rejects any later module whose options
/// differ. Paths are always populated (the loader substitutes installation
/// defaults), so comparison is plain structural equality.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JvmOptions {
    pub class_path: String,
    pub library_path: String,
    pub version: i32,
    pub debug: bool,
    pub debug_port: u16,
    pub verbose: bool,
    pub additional_options: Vec<String>,
}

pub const DEBUG_PORT_DEFAULT: u16 = 9876;

#[cfg(target_os = "windows")]
const LIBJVM: &str = "jvm.dll";
#[cfg(target_os = "macos")]
const LIBJVM: &str = "libjvm.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBJVM: &str = "libjvm.so";

const CREATE_JVM_SYMBOL: &[u8] = b"JNI_CreateJavaVM";
const GET_CREATED_JVMS_SYMBOL: &[u8] = b"JNI_GetCreatedJavaVMs";

type CreateJavaVmFn =
    unsafe extern "system" fn(pvm: *mut *mut JavaVM, penv: *mut *mut c_void, args: *mut c_void) -> jint;
type GetCreatedJavaVmsFn =
    unsafe extern "system" fn(vm_buf: *mut *mut JavaVM, buf_len: jsize, n_vms: *mut jsize) -> jint;

/// A handle to the process-wide Java virtual machine.
///
/// Cloning hands out another reference to the same VM; the `libjvm` image is
/// kept mapped for as long as any handle lives. The VM itself is torn down by
/// the host manager through [`EmbeddedRuntime::shut_down`] once the last
/// module is gone.
#[derive(Clone)]
pub struct Jvm {
    lib: Arc<SharedLibrary>,
    vm: *mut JavaVM,
}

// The JavaVM pointer is valid process-wide and the invocation interface is
// thread-safe by the JNI contract; per-thread JNIEnv pointers are never
// stored here.
unsafe impl Send for Jvm {}
unsafe impl Sync for Jvm {}

impl Jvm {
    /// Create the JVM, or attach to one that already exists in this process.
    ///
    /// The launcher library is located through `JAVA_HOME` first and the
    /// platform's library search path last. When a VM already exists
    /// (`JNI_EEXIST`), the requested JNI version is validated against it via
    /// `GetEnv`; an incompatible version is a failure, not a silent downgrade.
    pub fn launch(options: &JvmOptions) -> Result<Jvm, Error> {
        let lib = load_libjvm()?;
        let version = jni_version(options.version);
        let args = build_launch_args(options)?;

        let mut vm: *mut JavaVM = ptr::null_mut();
        let status = {
            let create = unsafe { lib.symbol::<CreateJavaVmFn>(CREATE_JVM_SYMBOL)? };

            let mut jvm_opts: Vec<JavaVMOption> = args
                .iter()
                .map(|s| JavaVMOption {
                    optionString: s.as_ptr() as *mut c_char,
                    extraInfo: ptr::null_mut(),
                })
                .collect();
            let mut init_args = JavaVMInitArgs {
                version,
                nOptions: jvm_opts.len() as jint,
                options: jvm_opts.as_mut_ptr(),
                ignoreUnrecognized: JNI_FALSE,
            };

            let mut env: *mut c_void = ptr::null_mut();
            let status = unsafe {
                create(
                    &mut vm,
                    &mut env,
                    &mut init_args as *mut JavaVMInitArgs as *mut c_void,
                )
            };
            if status == JNI_EEXIST {
                let get_created =
                    unsafe { lib.symbol::<GetCreatedJavaVmsFn>(GET_CREATED_JVMS_SYMBOL)? };
                let mut count: jsize = 0;
                let found = unsafe { get_created(&mut vm, 1, &mut count) };
                if found == JNI_OK && count > 0 && !vm.is_null() {
                    let get_env = unsafe { (**vm).GetEnv }
                        .ok_or(Error::Jni("GetEnv", jni_sys::JNI_ERR))?;
                    let got = unsafe { get_env(vm, &mut env, version) };
                    if got == JNI_EVERSION {
                        tracing::error!(
                            "a JVM is already running but does not support JNI version {:#x}",
                            version
                        );
                        return Err(Error::RuntimeLaunch(format!(
                            "the running JVM does not support JNI version {:#x}",
                            version
                        )));
                    }
                    got
                } else {
                    found
                }
            } else {
                status
            }
        };

        if status != JNI_OK || vm.is_null() {
            tracing::error!("failed to launch the JVM (status {})", status);
            return Err(Error::RuntimeLaunch(format!(
                "JNI_CreateJavaVM returned {}",
                status
            )));
        }

        Ok(Jvm {
            lib: Arc::new(lib),
            vm,
        })
    }

    /// Attach the calling thread to the VM for the duration of the guard.
    ///
    /// Attachment is per OS thread, so every entry point that calls into the
    /// VM takes its own guard, whether or not the thread that created the
    /// module happens to be the one calling.
    pub fn attach(&self) -> Result<AttachGuard<'_>, Error> {
        let attach = unsafe { (**self.vm).AttachCurrentThread }
            .ok_or(Error::Jni("AttachCurrentThread", jni_sys::JNI_ERR))?;
        let mut env: *mut c_void = ptr::null_mut();
        let status = unsafe { attach(self.vm, &mut env, ptr::null_mut()) };
        if status != JNI_OK || env.is_null() {
            tracing::error!("could not attach the current thread to the JVM (status {})", status);
            return Err(Error::Jni("AttachCurrentThread", status));
        }
        Ok(AttachGuard {
            vm: self,
            env: Env {
                raw: env as *mut JNIEnv,
            },
        })
    }
}

impl EmbeddedRuntime for Jvm {
    fn shut_down(&self) {
        match unsafe { (**self.vm).DestroyJavaVM } {
            Some(destroy) => {
                let status = unsafe { destroy(self.vm) };
                if status != JNI_OK {
                    tracing::error!("the JVM could not be destroyed (status {})", status);
                }
            }
            None => tracing::error!("JVM invocation table has no DestroyJavaVM entry"),
        }
    }
}

fn load_libjvm() -> Result<SharedLibrary, Error> {
    let mut last_err = None;
    for candidate in libjvm_candidates() {
        match SharedLibrary::load(&candidate) {
            Ok(lib) => return Ok(lib),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(Error::RuntimeLaunch("no libjvm candidates".to_owned())))
}

fn libjvm_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(home) = env::var("JAVA_HOME") {
        let home = PathBuf::from(home);
        candidates.push(home.join("lib").join("server").join(LIBJVM));
        candidates.push(home.join("jre").join("lib").join("server").join(LIBJVM));
        candidates.push(
            home.join("jre")
                .join("lib")
                .join("amd64")
                .join("server")
                .join(LIBJVM),
        );
    }
    // last resort: the platform's library search path
    candidates.push(PathBuf::from(LIBJVM));
    candidates
}

fn jni_version(version: i32) -> jint {
    match version {
        1 => JNI_VERSION_1_1,
        2 => JNI_VERSION_1_2,
        4 => JNI_VERSION_1_4,
        6 => JNI_VERSION_1_6,
        8 => JNI_VERSION_1_8,
        _ => JNI_VERSION_1_4,
    }
}

/// Fold [`JvmOptions`] into the option strings handed to the launcher.
fn build_launch_args(options: &JvmOptions) -> Result<Vec<CString>, Error> {
    let mut args = Vec::new();
    args.push(format!("-Djava.class.path={}", options.class_path));
    args.push(format!("-Djava.library.path={}", options.library_path));
    if options.debug {
        let port = if options.debug_port == 0 {
            DEBUG_PORT_DEFAULT
        } else {
            options.debug_port
        };
        args.push("-Xrs".to_owned());
        args.push("-Xdebug".to_owned());
        args.push(format!(
            "-Xrunjdwp:transport=dt_socket,address={},server=y,suspend=y",
            port
        ));
    }
    if options.verbose {
        args.push("-verbose:class".to_owned());
    }
    args.extend(options.additional_options.iter().cloned());

    args.into_iter()
        .map(|s| {
            CString::new(s).map_err(|_| Error::InvalidArgument("launch option contains a NUL byte"))
        })
        .collect()
}

/// Checked wrappers around the JNI native interface.
///
/// Every wrapper turns a pending Java exception (described and cleared) or an
/// unexpected null into an `Err`, so call sites read as straight-line code.
pub struct Env {
    raw: *mut JNIEnv,
}

impl Env {
    /// Wrap an environment pointer the VM already handed us, e.g. inside a
    /// native method the VM itself invoked.
    ///
    /// # Safety
    ///
    /// `raw` must be a live `JNIEnv` pointer for the current thread.
    pub unsafe fn from_raw(raw: *mut JNIEnv) -> Env {
        Env { raw }
    }

    pub fn raw(&self) -> *mut JNIEnv {
        self.raw
    }

    fn native(&self) -> &JNINativeInterface_ {
        unsafe { &**self.raw }
    }

    fn check_exception(&self, context: &'static str) -> Result<(), Error> {
        let occurred = match self.native().ExceptionOccurred {
            Some(f) => unsafe { f(self.raw) },
            None => ptr::null_mut(),
        };
        if occurred.is_null() {
            return Ok(());
        }
        if let Some(describe) = self.native().ExceptionDescribe {
            unsafe { describe(self.raw) };
        }
        if let Some(clear) = self.native().ExceptionClear {
            unsafe { clear(self.raw) };
        }
        tracing::error!("exception raised in the embedded runtime during {}", context);
        Err(Error::JavaException(context))
    }

    pub fn find_class(&self, name: &CStr) -> Result<jclass, Error> {
        let f = self
            .native()
            .FindClass
            .ok_or(Error::Jni("FindClass", jni_sys::JNI_ERR))?;
        let class = unsafe { f(self.raw, name.as_ptr()) };
        self.check_exception("FindClass")?;
        if class.is_null() {
            return Err(Error::Jni("FindClass", jni_sys::JNI_ERR));
        }
        Ok(class)
    }

    pub fn object_class(&self, obj: jobject) -> Result<jclass, Error> {
        let f = self
            .native()
            .GetObjectClass
            .ok_or(Error::Jni("GetObjectClass", jni_sys::JNI_ERR))?;
        let class = unsafe { f(self.raw, obj) };
        if class.is_null() {
            return Err(Error::Jni("GetObjectClass", jni_sys::JNI_ERR));
        }
        Ok(class)
    }

    pub fn method_id(&self, class: jclass, name: &CStr, sig: &CStr) -> Result<jmethodID, Error> {
        let f = self
            .native()
            .GetMethodID
            .ok_or(Error::Jni("GetMethodID", jni_sys::JNI_ERR))?;
        let method = unsafe { f(self.raw, class, name.as_ptr(), sig.as_ptr()) };
        self.check_exception("GetMethodID")?;
        if method.is_null() {
            return Err(Error::Jni("GetMethodID", jni_sys::JNI_ERR));
        }
        Ok(method)
    }

    pub fn new_object(
        &self,
        class: jclass,
        method: jmethodID,
        args: &[jvalue],
    ) -> Result<jobject, Error> {
        let f = self
            .native()
            .NewObjectA
            .ok_or(Error::Jni("NewObjectA", jni_sys::JNI_ERR))?;
        let obj = unsafe { f(self.raw, class, method, args.as_ptr()) };
        self.check_exception("NewObjectA")?;
        if obj.is_null() {
            return Err(Error::Jni("NewObjectA", jni_sys::JNI_ERR));
        }
        Ok(obj)
    }

    pub fn new_string(&self, s: &CStr) -> Result<jstring, Error> {
        let f = self
            .native()
            .NewStringUTF
            .ok_or(Error::Jni("NewStringUTF", jni_sys::JNI_ERR))?;
        let string = unsafe { f(self.raw, s.as_ptr()) };
        self.check_exception("NewStringUTF")?;
        if string.is_null() {
            return Err(Error::Jni("NewStringUTF", jni_sys::JNI_ERR));
        }
        Ok(string)
    }

    /// Call a `void` method; a Java exception is cleared and surfaced as an
    /// `Err` carrying `context`.
    pub fn call_void(
        &self,
        obj: jobject,
        method: jmethodID,
        args: &[jvalue],
        context: &'static str,
    ) -> Result<(), Error> {
        let f = self
            .native()
            .CallVoidMethodA
            .ok_or(Error::Jni("CallVoidMethodA", jni_sys::JNI_ERR))?;
        unsafe { f(self.raw, obj, method, args.as_ptr()) };
        self.check_exception(context)
    }

    /// Copy `bytes` into a fresh Java `byte[]`. The local reference is
    /// deleted again if population fails.
    pub fn byte_array_from(&self, bytes: &[u8]) -> Result<jbyteArray, Error> {
        if bytes.len() > jsize::max_value() as usize {
            return Err(Error::InvalidArgument("byte array too large for the JVM"));
        }
        let new_array = self
            .native()
            .NewByteArray
            .ok_or(Error::Jni("NewByteArray", jni_sys::JNI_ERR))?;
        let array = unsafe { new_array(self.raw, bytes.len() as jsize) };
        self.check_exception("NewByteArray")?;
        if array.is_null() {
            return Err(Error::Jni("NewByteArray", jni_sys::JNI_ERR));
        }
        let set = self
            .native()
            .SetByteArrayRegion
            .ok_or(Error::Jni("SetByteArrayRegion", jni_sys::JNI_ERR))?;
        unsafe {
            set(
                self.raw,
                array,
                0,
                bytes.len() as jsize,
                bytes.as_ptr() as *const jbyte,
            )
        };
        if let Err(e) = self.check_exception("SetByteArrayRegion") {
            self.delete_local_ref(array);
            return Err(e);
        }
        Ok(array)
    }

    /// Copy a Java `byte[]` out into native memory. An empty array is an
    /// error; there is no such thing as an empty serialized message.
    pub fn byte_array_to_vec(&self, array: jbyteArray) -> Result<Vec<u8>, Error> {
        let length = self
            .native()
            .GetArrayLength
            .ok_or(Error::Jni("GetArrayLength", jni_sys::JNI_ERR))?;
        let len = unsafe { length(self.raw, array) };
        if len <= 0 {
            return Err(Error::InvalidArgument("serialized message is empty"));
        }
        let get = self
            .native()
            .GetByteArrayRegion
            .ok_or(Error::Jni("GetByteArrayRegion", jni_sys::JNI_ERR))?;
        let mut buf = vec![0u8; len as usize];
        unsafe { get(self.raw, array, 0, len, buf.as_mut_ptr() as *mut jbyte) };
        self.check_exception("GetByteArrayRegion")?;
        Ok(buf)
    }

    /// Promote a local reference to a global one that survives the current
    /// attachment.
    pub fn new_global_ref(&self, obj: jobject) -> Result<jobject, Error> {
        let f = self
            .native()
            .NewGlobalRef
            .ok_or(Error::Jni("NewGlobalRef", jni_sys::JNI_ERR))?;
        let global = unsafe { f(self.raw, obj) };
        if global.is_null() {
            tracing::error!("failed to take a global reference; the VM is out of memory");
            return Err(Error::Jni("NewGlobalRef", jni_sys::JNI_ERR));
        }
        Ok(global)
    }

    pub fn delete_global_ref(&self, obj: jobject) {
        if let Some(f) = self.native().DeleteGlobalRef {
            unsafe { f(self.raw, obj) };
        }
    }

    pub fn delete_local_ref(&self, obj: jobject) {
        if let Some(f) = self.native().DeleteLocalRef {
            unsafe { f(self.raw, obj) };
        }
    }
}

/// A scoped thread attachment.
///
/// Detaches on drop, on every exit path, so attach/detach pairs cannot be
/// unbalanced.
pub struct AttachGuard<'vm> {
    vm: &'vm Jvm,
    env: Env,
}

impl std::ops::Deref for AttachGuard<'_> {
    type Target = Env;

    fn deref(&self) -> &Env {
        &self.env
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        match unsafe { (**self.vm.vm).DetachCurrentThread } {
            Some(detach) => {
                let status = unsafe { detach(self.vm.vm) };
                if status != JNI_OK {
                    tracing::error!(
                        "could not detach the current thread from the JVM (status {})",
                        status
                    );
                }
            }
            None => tracing::error!("JVM invocation table has no DetachCurrentThread entry"),
        }
    }
}
