use crate::error::Error;
use std::sync::{Arc, Mutex};

/// An embedded foreign-language runtime whose lifetime is guarded by a
/// [`HostManager`].
///
/// Implementations are cheap handles (`Clone` hands out another reference to
/// the same underlying runtime); `shut_down` releases the runtime itself and
/// is called exactly once, by the manager, after the last module detaches.
pub trait EmbeddedRuntime: Clone {
    fn shut_down(&self);
}

struct HostState<R, C> {
    /// The options the runtime was created with. Compared structurally
    /// against every later create; immutable once set.
    config: C,
    runtime: R,
    /// Modules currently attached to the runtime.
    modules: usize,
}

/// Guards creation and teardown of a process-wide embedded runtime.
///
/// Most runtimes of this kind (a JVM in particular) are expensive and cannot
/// be created twice in one process, so creation must happen exactly once no
/// matter how many modules ask for it, and teardown only after the last
/// module is gone. The manager serializes the create/teardown transition
/// under one mutex; the runtime bootstrap itself runs while that mutex is
/// held, so two racing first-time creates cannot both observe "no runtime
/// yet".
///
/// There is no hidden global: whoever owns the manager owns the singleton,
/// and every operation goes through that owner's handle.
pub struct HostManager<R, C> {
    state: Mutex<Option<HostState<R, C>>>,
}

impl<R: EmbeddedRuntime, C: Clone + PartialEq> HostManager<R, C> {
    pub fn new() -> Self {
        HostManager {
            state: Mutex::new(None),
        }
    }

    /// Create the runtime, or verify that the one already running was created
    /// with an equal configuration.
    ///
    /// A structurally different configuration is a hard failure: the caller
    /// must not silently receive a runtime configured by somebody else. The
    /// attach count is not changed; see [`add`](Self::add) and
    /// [`claim`](Self::claim).
    pub fn create(
        &self,
        config: &C,
        bootstrap: impl FnOnce() -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            Some(active) => {
                if active.config != *config {
                    tracing::error!("embedded runtime already created with different options");
                    return Err(Error::ConfigMismatch);
                }
                Ok(active.runtime.clone())
            }
            None => {
                let runtime = bootstrap()?;
                *state = Some(HostState {
                    config: config.clone(),
                    runtime: runtime.clone(),
                    modules: 0,
                });
                Ok(runtime)
            }
        }
    }

    /// Record one more module attached to the runtime.
    pub fn add(&self) -> Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        let active = state.as_mut().ok_or(Error::ManagerEmpty)?;
        active.modules += 1;
        Ok(active.modules)
    }

    /// Record one module detached from the runtime.
    ///
    /// A remove that would take the count below zero indicates mismatched
    /// create/destroy pairing in the caller and is rejected with the count
    /// unchanged.
    pub fn remove(&self) -> Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        let active = state.as_mut().ok_or(Error::ManagerEmpty)?;
        if active.modules == 0 {
            tracing::error!("cannot remove a module from an empty host manager");
            return Err(Error::RefcountUnderflow);
        }
        active.modules -= 1;
        Ok(active.modules)
    }

    /// Number of modules currently attached. Zero when no runtime is active.
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| active.modules)
            .unwrap_or(0)
    }

    /// Tear the runtime down if nothing is attached to it.
    ///
    /// Returns `Ok(false)` (and leaves everything in place) while modules are
    /// still attached; returns `Ok(true)` once the runtime has been shut
    /// down, after which a later [`create`](Self::create) starts fresh.
    pub fn destroy(&self) -> Result<bool, Error> {
        let taken = {
            let mut state = self.state.lock().unwrap();
            let active = state.as_ref().ok_or(Error::ManagerEmpty)?;
            if active.modules != 0 {
                tracing::info!(
                    "host manager has {} modules attached and will not be destroyed",
                    active.modules
                );
                return Ok(false);
            }
            state.take()
        };
        // the foreign call happens with the lock released
        if let Some(active) = taken {
            active.runtime.shut_down();
        }
        Ok(true)
    }

    /// Create-or-verify and attach in one step, returning a claim whose drop
    /// detaches and tears the runtime down if it was the last user.
    ///
    /// This is the composition module hosts use: doing both under a single
    /// lock acquisition means a concurrent release cannot slip between the
    /// create and the attach.
    pub fn claim(
        self: &Arc<Self>,
        config: &C,
        bootstrap: impl FnOnce() -> Result<R, Error>,
    ) -> Result<RuntimeClaim<R, C>, Error> {
        let mut state = self.state.lock().unwrap();
        let runtime = match &mut *state {
            Some(active) => {
                if active.config != *config {
                    tracing::error!("embedded runtime already created with different options");
                    return Err(Error::ConfigMismatch);
                }
                active.modules += 1;
                active.runtime.clone()
            }
            None => {
                let runtime = bootstrap()?;
                *state = Some(HostState {
                    config: config.clone(),
                    runtime: runtime.clone(),
                    modules: 1,
                });
                runtime
            }
        };
        drop(state);
        Ok(RuntimeClaim {
            manager: Arc::clone(self),
            runtime,
        })
    }

    /// Detach one module and shut the runtime down if it was the last one.
    fn release_one(&self) -> Result<(), Error> {
        let taken = {
            let mut state = self.state.lock().unwrap();
            let active = state.as_mut().ok_or(Error::ManagerEmpty)?;
            if active.modules == 0 {
                return Err(Error::RefcountUnderflow);
            }
            active.modules -= 1;
            if active.modules == 0 {
                state.take()
            } else {
                None
            }
        };
        if let Some(active) = taken {
            active.runtime.shut_down();
        }
        Ok(())
    }
}

impl<R: EmbeddedRuntime, C: Clone + PartialEq> Default for HostManager<R, C> {
    fn default() -> Self {
        HostManager::new()
    }
}

/// One module's claim on the shared embedded runtime.
///
/// Releasing the claim is guaranteed on every exit path: dropping it
/// decrements the manager's count and, for the last module out, shuts the
/// runtime down.
pub struct RuntimeClaim<R: EmbeddedRuntime, C: Clone + PartialEq> {
    manager: Arc<HostManager<R, C>>,
    runtime: R,
}

impl<R: EmbeddedRuntime, C: Clone + PartialEq> RuntimeClaim<R, C> {
    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: EmbeddedRuntime, C: Clone + PartialEq> Drop for RuntimeClaim<R, C> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_one() {
            tracing::error!("releasing a runtime claim failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Clone)]
    struct MockRuntime {
        id: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl MockRuntime {
        fn same_as(&self, other: &MockRuntime) -> bool {
            Arc::ptr_eq(&self.id, &other.id)
        }
    }

    impl EmbeddedRuntime for MockRuntime {
        fn shut_down(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        manager: Arc<HostManager<MockRuntime, String>>,
        bootstraps: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                manager: Arc::new(HostManager::new()),
                bootstraps: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn bootstrap(&self) -> impl FnOnce() -> Result<MockRuntime, Error> {
            let bootstraps = self.bootstraps.clone();
            let shutdowns = self.shutdowns.clone();
            move || {
                bootstraps.fetch_add(1, Ordering::SeqCst);
                Ok(MockRuntime {
                    id: Arc::new(AtomicUsize::new(0)),
                    shutdowns,
                })
            }
        }
    }

    #[test]
    fn remove_below_zero_is_rejected() {
        let fx = Fixture::new();
        fx.manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();

        assert_eq!(fx.manager.add().unwrap(), 1);
        assert_eq!(fx.manager.remove().unwrap(), 0);
        assert!(matches!(
            fx.manager.remove(),
            Err(Error::RefcountUnderflow)
        ));
        assert_eq!(fx.manager.size(), 0);
    }

    #[test]
    fn operations_require_an_active_runtime() {
        let fx = Fixture::new();
        assert!(matches!(fx.manager.add(), Err(Error::ManagerEmpty)));
        assert!(matches!(fx.manager.remove(), Err(Error::ManagerEmpty)));
        assert!(matches!(fx.manager.destroy(), Err(Error::ManagerEmpty)));
        assert_eq!(fx.manager.size(), 0);
    }

    #[test]
    fn create_is_idempotent_for_equal_configs() {
        let fx = Fixture::new();
        let first = fx
            .manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        let second = fx
            .manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert!(first.same_as(&second));
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn create_with_different_config_is_rejected() {
        let fx = Fixture::new();
        let first = fx
            .manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        fx.manager.add().unwrap();

        assert!(matches!(
            fx.manager.create(&"other".to_owned(), fx.bootstrap()),
            Err(Error::ConfigMismatch)
        ));
        // the existing runtime, its stored config, and its count are untouched
        assert_eq!(fx.manager.size(), 1);
        let again = fx
            .manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert!(first.same_as(&again));
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_is_gated_on_the_module_count() {
        let fx = Fixture::new();
        fx.manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        fx.manager.add().unwrap();

        assert_eq!(fx.manager.destroy().unwrap(), false);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(fx.manager.size(), 1);

        fx.manager.remove().unwrap();
        assert_eq!(fx.manager.destroy().unwrap(), true);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 1);

        // a fresh create reinitializes from scratch
        fx.manager
            .create(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn claim_and_drop_leave_no_runtime_behind() {
        let fx = Fixture::new();
        let claim = fx
            .manager
            .claim(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert_eq!(fx.manager.size(), 1);
        drop(claim);
        assert_eq!(fx.manager.size(), 0);
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn two_modules_share_one_runtime() {
        let fx = Fixture::new();

        // first module boots the runtime
        let foo = fx
            .manager
            .claim(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert_eq!(fx.manager.size(), 1);
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);

        // second module with the same options attaches, no second boot
        let bar = fx
            .manager
            .claim(&"cfg".to_owned(), fx.bootstrap())
            .unwrap();
        assert_eq!(fx.manager.size(), 2);
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);
        assert!(foo.runtime().same_as(bar.runtime()));

        drop(foo);
        assert_eq!(fx.manager.size(), 1);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 0);

        drop(bar);
        assert_eq!(fx.manager.size(), 0);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_claims_boot_exactly_once() {
        let fx = Fixture::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = fx.manager.clone();
                let barrier = barrier.clone();
                let bootstrap = fx.bootstrap();
                std::thread::spawn(move || {
                    let claim = manager.claim(&"cfg".to_owned(), bootstrap).unwrap();
                    // hold every claim until all threads have one
                    barrier.wait();
                    drop(claim);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fx.manager.size(), 0);
        assert_eq!(fx.bootstraps.load(Ordering::SeqCst), 1);
        assert_eq!(fx.shutdowns.load(Ordering::SeqCst), 1);
    }
}
