use crate::error::Error;
use gatehouse_module::{BrokerHandle, Message, MessageHandle, ModuleHandle};
use libc::c_int;
use std::sync::Arc;

/// Identity of the module a publication originates from.
///
/// This is the gateway's pointer to the module instance, treated as an opaque
/// integer everywhere outside the gateway itself; it is never dereferenced on
/// behalf of a publish.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleRef(*mut ModuleHandle);

// ModuleRef is an identity, not a dereferenceable pointer.
unsafe impl Send for ModuleRef {}
unsafe impl Sync for ModuleRef {}

impl ModuleRef {
    pub fn from_raw(ptr: *mut ModuleHandle) -> Self {
        ModuleRef(ptr)
    }

    pub fn as_ptr(&self) -> *mut ModuleHandle {
        self.0
    }
}

/// The narrow contract this subsystem has with the message broker: publish a
/// message under a module's identity. Delivery semantics live elsewhere.
pub trait Broker: Send + Sync {
    fn publish(&self, source: ModuleRef, message: Message) -> Result<(), Error>;
}

/// Move a broker across the FFI boundary as a thin pointer.
///
/// Trait objects are fat, so the `Arc` is boxed to yield a thin pointer that
/// survives a round trip through a foreign runtime as a plain integer.
/// Release it with [`broker_from_raw`].
pub fn broker_into_raw(broker: Arc<dyn Broker>) -> *mut BrokerHandle {
    Box::into_raw(Box::new(broker)) as *mut BrokerHandle
}

/// Reclaim a broker previously passed out through [`broker_into_raw`].
///
/// # Safety
///
/// `ptr` must have come from `broker_into_raw` and must not be used again
/// afterward.
pub unsafe fn broker_from_raw(ptr: *mut BrokerHandle) -> Arc<dyn Broker> {
    *Box::from_raw(ptr as *mut Arc<dyn Broker>)
}

/// Borrow the broker behind a raw handle for the duration of `f`.
///
/// # Safety
///
/// `ptr` must be a live pointer from [`broker_into_raw`].
pub unsafe fn with_broker<T>(ptr: *mut BrokerHandle, f: impl FnOnce(&dyn Broker) -> T) -> T {
    let broker = &*(ptr as *const Arc<dyn Broker>);
    f(broker.as_ref())
}

/// Publish `message` on `broker` under `module`'s identity.
///
/// This is the C-visible form of the broker contract; modules and binding
/// libraries re-enter the gateway through it. Returns 0 on success and
/// nonzero on any failure.
///
/// # Safety
///
/// `broker` must be a live [`broker_into_raw`] pointer and `message` must
/// point to a live [`Message`] owned by this process image.
#[no_mangle]
pub unsafe extern "C" fn gatehouse_broker_publish(
    broker: *mut BrokerHandle,
    module: *mut ModuleHandle,
    message: *const MessageHandle,
) -> c_int {
    if broker.is_null() || message.is_null() {
        tracing::error!(
            "invalid publish arguments (broker = {:?}, message = {:?})",
            broker,
            message
        );
        return 1;
    }
    let message = (*(message as *const Message)).clone();
    match with_broker(broker, |b| b.publish(ModuleRef::from_raw(module), message)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("broker publish failed: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(ModuleRef, Message)>>,
    }

    impl Broker for RecordingBroker {
        fn publish(&self, source: ModuleRef, message: Message) -> Result<(), Error> {
            self.published.lock().unwrap().push((source, message));
            Ok(())
        }
    }

    #[test]
    fn raw_round_trip_publishes() {
        let broker = Arc::new(RecordingBroker::default());
        let raw = broker_into_raw(broker.clone());

        let message = Message::with_content(&b"payload"[..]);
        let module = 0x1000 as *mut gatehouse_module::ModuleHandle;
        let rc = unsafe {
            gatehouse_broker_publish(
                raw,
                module,
                &message as *const Message as *const MessageHandle,
            )
        };
        assert_eq!(rc, 0);

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, ModuleRef::from_raw(module));
        assert_eq!(published[0].1, message);
        drop(published);

        unsafe { drop(broker_from_raw(raw)) };
    }

    #[test]
    fn null_arguments_rejected() {
        let rc = unsafe { gatehouse_broker_publish(std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null()) };
        assert_ne!(rc, 0);
    }
}
