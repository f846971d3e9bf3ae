//! Role to machine-class bookkeeping.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::error::{LifecycleError, Result};
use crate::lifecycle::InstanceManager;
use crate::machine::MachineClass;
use crate::role::Role;

/// What a context knows: which class fills each role, which of those are
/// overridable defaults, and one instance manager per class.
#[derive(Default)]
pub(super) struct Registry {
    roles: IndexMap<Role, MachineClass>,
    weak: HashSet<Role>,
    managers: IndexMap<TypeId, (MachineClass, Arc<InstanceManager>)>,
}

impl Registry {
    /// Register `class` for `roles`.
    ///
    /// A weak registration never displaces anything. A regular one
    /// displaces only weak registrations. Nothing changes if any role is
    /// rejected.
    pub(super) fn register(
        &mut self,
        class: &MachineClass,
        roles: &[Role],
        weak: bool,
    ) -> Result<()> {
        for role in roles {
            if !class.provides(role) {
                return Err(LifecycleError::RoleNotProvided {
                    class: class.name().to_string(),
                    role: role.to_string(),
                }
                .into());
            }
            if let Some(existing) = self.roles.get(role) {
                if !weak && !self.weak.contains(role) {
                    return Err(LifecycleError::DuplicateRole {
                        role: role.to_string(),
                        existing: existing.name().to_string(),
                    }
                    .into());
                }
            }
        }

        for role in roles {
            if let Some(existing) = self.roles.get(role) {
                if weak {
                    continue;
                }
                debug!(
                    "'{}' replaces default '{}' for role '{}'",
                    class.name(),
                    existing.name(),
                    role
                );
                self.weak.remove(role);
            } else if weak {
                self.weak.insert(*role);
            }
            debug!("registered '{}' for role '{}'", class.name(), role);
            self.roles.insert(*role, class.clone());
        }
        Ok(())
    }

    /// The class registered for `role`.
    pub(super) fn class_for(&self, role: &Role) -> Option<&MachineClass> {
        self.roles.get(role)
    }

    /// Whether `role` is only filled by a default.
    pub(super) fn is_weak(&self, role: &Role) -> bool {
        self.weak.contains(role)
    }

    /// Registered roles in registration order.
    pub(super) fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.keys()
    }

    /// Whether `class` is registered for some role or has been instantiated.
    pub(super) fn knows(&self, class: &MachineClass) -> bool {
        self.managers.contains_key(&class.id()) || self.roles.values().any(|c| c == class)
    }

    /// The manager for `class`, created on first use.
    pub(super) fn manager(&mut self, class: &MachineClass) -> Arc<InstanceManager> {
        let (_, manager) = self
            .managers
            .entry(class.id())
            .or_insert_with(|| (class.clone(), Arc::new(InstanceManager::new(class.name()))));
        Arc::clone(manager)
    }

    /// Classes whose instance is still alive.
    pub(super) fn alive(&self) -> Vec<&'static str> {
        self.managers
            .values()
            .filter(|(_, manager)| manager.is_alive())
            .map(|(class, _)| class.name())
            .collect()
    }
}
