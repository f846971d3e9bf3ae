//! Leases on a managed machine instance.

use std::sync::Arc;

use log::warn;
use tokio::sync::{MappedMutexGuard, MutexGuard};

use super::manager::InstanceManager;
use crate::error::{LifecycleError, Result};
use crate::machine::{Machine, SharedMachine};

/// Access to a live machine, handed out by an [`InstanceManager`].
///
/// Give a lease back with [`release`](Self::release); that is where the
/// instance gets torn down when this was the last (or an exclusive) lease.
/// A lease that is merely dropped is released too, but its teardown runs
/// in the background.
pub struct Lease {
    manager: Arc<InstanceManager>,
    machine: SharedMachine,
    generation: u64,
    exclusive: bool,
    released: bool,
}

impl Lease {
    pub(super) fn new(
        manager: Arc<InstanceManager>,
        machine: SharedMachine,
        generation: u64,
        exclusive: bool,
    ) -> Self {
        Self {
            manager,
            machine,
            generation,
            exclusive,
            released: false,
        }
    }

    /// Name of the leased machine's class.
    pub fn class(&self) -> &'static str {
        self.manager.class()
    }

    /// Whether this lease is exclusive.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the instance this lease was issued for is still the live one.
    pub fn is_current(&self) -> bool {
        self.manager.is_alive() && self.manager.generation() == self.generation
    }

    /// The leased instance.
    pub fn machine(&self) -> SharedMachine {
        Arc::clone(&self.machine)
    }

    /// Whether both leases refer to the same instance.
    pub fn ptr_eq(&self, other: &Lease) -> bool {
        Arc::ptr_eq(&self.machine, &other.machine)
    }

    /// Lock the machine for use.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Machine>> {
        self.machine.lock().await
    }

    /// Lock the machine as its concrete type.
    pub async fn lock_as<M: Machine>(&self) -> Result<MappedMutexGuard<'_, M>> {
        let guard = self.machine.lock().await;
        MutexGuard::try_map(guard, |machine| machine.downcast_mut::<M>()).map_err(|guard| {
            LifecycleError::TypeMismatch {
                expected: std::any::type_name::<M>().to_string(),
                found: guard.name().to_string(),
            }
            .into()
        })
    }

    /// Give the lease back, tearing the instance down if this was its last
    /// or exclusive lease.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match self.manager.release(self.generation, self.exclusive) {
            Some(ticket) => self.manager.finish(ticket).await,
            None => Ok(()),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("lease on '{}' dropped without release()", self.class());
        let Some(ticket) = self.manager.release(self.generation, self.exclusive) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = Arc::clone(&self.manager);
                runtime.spawn(async move {
                    if let Err(e) = manager.finish(ticket).await {
                        warn!("background teardown of '{}' failed: {}", manager.class(), e);
                    }
                });
            }
            Err(_) => warn!(
                "no async runtime; '{}' is not torn down cleanly",
                self.class()
            ),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("class", &self.class())
            .field("generation", &self.generation)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}
