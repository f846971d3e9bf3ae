//! Lifecycle of the single live instance of one machine class.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use super::lease::Lease;
use super::release::ReleaseStack;
use crate::error::{LifecycleError, Result};
use crate::machine::{Machine, Scoped, SharedMachine};

/// Exit status forced onto a machine that is torn down.
pub const TEARDOWN_STATUS: i32 = 1;

/// A live instance and everything that has to run to bring it down.
struct Instance {
    machine: SharedMachine,
    releases: ReleaseStack,
}

#[derive(Default)]
struct ManagerState {
    instance: Option<Instance>,
    users: usize,
    available: bool,
    generation: u64,
}

/// Owns at most one live instance of a machine class and hands out leases
/// on it.
///
/// Leases are either shared (any number at once) or exclusive (no other
/// lease while it is held). The instance is torn down when an exclusive
/// lease is released, or when the last shared lease is.
pub struct InstanceManager {
    class: &'static str,
    state: Mutex<ManagerState>,
}

impl InstanceManager {
    /// Create a manager with no instance.
    pub fn new(class: &'static str) -> Self {
        Self {
            class,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Name of the managed class.
    pub fn class(&self) -> &'static str {
        self.class
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an instance is alive.
    pub fn is_alive(&self) -> bool {
        self.lock().instance.is_some()
    }

    /// Incremented each time an instance is initialized.
    pub(super) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of outstanding leases.
    pub fn users(&self) -> usize {
        self.lock().users
    }

    /// Build the instance with `factory`.
    ///
    /// The machine's own [`deinit`](Machine::deinit) is registered last, so
    /// it runs before everything the factory acquired is released.
    pub async fn init<F>(&self, factory: F) -> Result<()>
    where
        F: Future<Output = Result<Scoped<Box<dyn Machine>>>>,
    {
        if self.is_alive() {
            return Err(self.already_initialized());
        }

        debug!("initializing '{}'", self.class);
        let Scoped {
            value,
            mut releases,
        } = factory.await?;

        let machine: SharedMachine = Arc::new(tokio::sync::Mutex::new(value));
        let deinit = Arc::clone(&machine);
        releases.push(format!("deinit '{}'", self.class), async move {
            deinit.lock().await.deinit().await
        });

        // The factory may have raced with another initialization
        let raced = {
            let mut state = self.lock();
            if state.instance.is_some() {
                Some(releases)
            } else {
                state.instance = Some(Instance { machine, releases });
                state.users = 0;
                state.available = true;
                state.generation += 1;
                None
            }
        };

        if let Some(releases) = raced {
            releases.run().await?;
            return Err(self.already_initialized());
        }
        Ok(())
    }

    /// Lease the live instance.
    pub fn request(self: &Arc<Self>, exclusive: bool) -> Result<Lease> {
        let mut state = self.lock();
        let Some(instance) = &state.instance else {
            return Err(LifecycleError::NotAlive {
                class: self.class.to_string(),
            }
            .into());
        };
        let machine = Arc::clone(&instance.machine);

        if !state.available {
            return Err(LifecycleError::Unavailable {
                class: self.class.to_string(),
            }
            .into());
        }
        if exclusive && state.users > 0 {
            return Err(LifecycleError::Busy {
                class: self.class.to_string(),
                users: state.users,
            }
            .into());
        }

        state.users += 1;
        if exclusive {
            state.available = false;
        }
        debug!(
            "leased '{}' ({}, {} user(s))",
            self.class,
            if exclusive { "exclusive" } else { "shared" },
            state.users
        );

        Ok(Lease::new(Arc::clone(self), machine, state.generation, exclusive))
    }

    /// Force the instance down.
    ///
    /// Sets the machine's exit status to [`TEARDOWN_STATUS`] and runs its
    /// release stack. Outstanding leases become stale.
    pub async fn teardown(&self) -> Result<()> {
        let instance = self.take_instance(None).ok_or_else(|| LifecycleError::NotAlive {
            class: self.class.to_string(),
        })?;
        self.run_teardown(instance).await
    }

    /// Return a lease. Yields the instance when the lease ends its lifetime.
    pub(super) fn release(&self, generation: u64, exclusive: bool) -> Option<TeardownTicket> {
        let mut state = self.lock();
        if state.instance.is_none() || state.generation != generation {
            debug!("stale lease on '{}' released", self.class);
            return None;
        }

        state.users = state.users.saturating_sub(1);
        if exclusive || state.users == 0 {
            drop(state);
            self.take_instance(Some(generation)).map(TeardownTicket)
        } else {
            None
        }
    }

    fn take_instance(&self, generation: Option<u64>) -> Option<Instance> {
        let mut state = self.lock();
        if generation.is_some_and(|g| g != state.generation) {
            return None;
        }
        let instance = state.instance.take()?;
        state.users = 0;
        state.available = true;
        Some(instance)
    }

    async fn run_teardown(&self, instance: Instance) -> Result<()> {
        debug!("tearing down '{}'", self.class);
        instance.machine.lock().await.set_exit_status(TEARDOWN_STATUS);
        instance.releases.run().await
    }

    /// Run a teardown claimed by [`release`](Self::release).
    pub(super) async fn finish(&self, ticket: TeardownTicket) -> Result<()> {
        self.run_teardown(ticket.0).await
    }

    fn already_initialized(&self) -> crate::Error {
        LifecycleError::AlreadyInitialized {
            class: self.class.to_string(),
        }
        .into()
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.instance.is_some() {
            warn!("instance manager for '{}' dropped with a live instance", self.class);
        }
    }
}

/// The right to run a teardown, handed out to exactly one releaser.
pub(super) struct TeardownTicket(Instance);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::{MockLab, SERIAL};

    async fn mock() -> Result<Scoped<Box<dyn Machine>>> {
        Ok(Scoped::new(Box::new(MockLab { status: 0, serial: 0 }) as Box<dyn Machine>))
    }

    async fn broken() -> Result<Scoped<Box<dyn Machine>>> {
        Err(crate::error::ChannelError::Closed.into())
    }

    fn manager() -> Arc<InstanceManager> {
        Arc::new(InstanceManager::new("MockLab"))
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        m.init(mock()).await.unwrap();
        let err = m.init(mock()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::AlreadyInitialized { .. })
        ));
        m.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_requires_live_instance() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        let err = m.request(false).unwrap_err();
        assert!(matches!(err, crate::Error::Lifecycle(LifecycleError::NotAlive { .. })));
        assert!(matches!(
            m.teardown().await.unwrap_err(),
            crate::Error::Lifecycle(LifecycleError::NotAlive { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_leases_tear_down_with_the_last() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        m.init(mock()).await.unwrap();

        let a = m.request(false).unwrap();
        let b = m.request(false).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(m.users(), 2);

        a.release().await.unwrap();
        assert!(m.is_alive());
        b.release().await.unwrap();
        assert!(!m.is_alive());
    }

    #[tokio::test]
    async fn test_exclusive_lease_blocks_and_tears_down() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        m.init(mock()).await.unwrap();

        let shared = m.request(false).unwrap();
        assert!(matches!(
            m.request(true).unwrap_err(),
            crate::Error::Lifecycle(LifecycleError::Busy { users: 1, .. })
        ));
        shared.release().await.unwrap();

        m.init(mock()).await.unwrap();
        let exclusive = m.request(true).unwrap();
        assert!(matches!(
            m.request(false).unwrap_err(),
            crate::Error::Lifecycle(LifecycleError::Unavailable { .. })
        ));
        exclusive.release().await.unwrap();
        assert!(!m.is_alive());
    }

    #[tokio::test]
    async fn test_teardown_sets_sentinel_and_stales_leases() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        m.init(mock()).await.unwrap();
        let lease = m.request(false).unwrap();
        let machine = lease.machine();

        m.teardown().await.unwrap();
        assert_eq!(machine.lock().await.exit_status(), TEARDOWN_STATUS);

        // A new instance is not affected by the stale lease
        m.init(mock()).await.unwrap();
        let fresh = m.request(false).unwrap();
        lease.release().await.unwrap();
        assert!(m.is_alive());
        assert_eq!(m.users(), 1);
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_factory_leaves_nothing_alive() {
        let _serial = SERIAL.lock().await;
        let m = manager();
        let err = m.init(broken()).await.unwrap_err();
        assert!(err.is_closed());
        assert!(!m.is_alive());
    }
}
