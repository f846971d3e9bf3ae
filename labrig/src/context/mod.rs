//! The context: where machines are registered and requested.
//!
//! Test code asks a [`Context`] for a role and gets back a [`Lease`] on the
//! one live instance of whatever class fills that role, creating it first if
//! needed. Machine classes get the context passed into their constructor, so
//! they can request the machines they depend on in turn.
//!
//! ```rust,no_run
//! use labrig::Context;
//! use labrig::machine::LocalShell;
//! use labrig::role::LAB_HOST;
//!
//! # async fn example() -> Result<(), labrig::Error> {
//! let ctx = Context::with_defaults();
//! let _scope = ctx.enter();
//!
//! let lab = ctx.request(LAB_HOST).await?;
//! let output = lab.lock_as::<LocalShell>().await?.exec("uname -a").await?;
//! println!("{}", output);
//! lab.release().await?;
//! # Ok(())
//! # }
//! ```

mod handle;
mod registry;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::error::{LifecycleError, Result};
use crate::lifecycle::{InstanceManager, Lease};
use crate::machine::{FromContext, LocalShell, MachineClass};
use crate::role::{BUILD_HOST, LAB_HOST, Role};

pub use handle::ContextHandle;
use registry::Registry;

static GLOBAL: Lazy<Context> = Lazy::new(Context::with_defaults);

/// What a request asks for: a role, or a machine class directly.
#[derive(Debug, Clone)]
pub enum Target {
    Role(Role),
    Class(MachineClass),
}

impl From<Role> for Target {
    fn from(role: Role) -> Self {
        Target::Role(role)
    }
}

impl From<MachineClass> for Target {
    fn from(class: MachineClass) -> Self {
        Target::Class(class)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Role(role) => write!(f, "role '{}'", role),
            Target::Class(class) => write!(f, "class '{}'", class.name()),
        }
    }
}

/// How an instance is handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Tear down a live instance and start a fresh one.
    pub reset: bool,

    /// Forbid other leases while this one is held, and tear the instance
    /// down when it is released.
    pub exclusive: bool,
}

impl RequestOptions {
    /// Shared access to the current instance.
    pub fn shared() -> Self {
        Self::default()
    }

    /// Set `reset`.
    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Set `exclusive`.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

struct ContextInner {
    registry: Mutex<Registry>,
    open_scopes: AtomicUsize,
}

/// Registry of machine classes and owner of their instances.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                registry: Mutex::new(Registry::default()),
                open_scopes: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a context with [`LocalShell`] as the overridable default for
    /// [`LAB_HOST`] and [`BUILD_HOST`].
    pub fn with_defaults() -> Self {
        let ctx = Self::new();
        let shell = MachineClass::of::<LocalShell>();
        if let Err(e) = ctx.register(shell, &[LAB_HOST, BUILD_HOST], true) {
            warn!("cannot register default machines: {}", e);
        }
        ctx
    }

    /// The process-wide context, with defaults registered.
    ///
    /// Meant for top-level test runners; library code takes a `Context`.
    pub fn global() -> &'static Context {
        &GLOBAL
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `class` for `roles`.
    ///
    /// With `weak`, the registration is a default: it is skipped for roles
    /// that already have a machine and is replaced by a later non-weak
    /// registration. Otherwise registering a role twice fails with
    /// [`LifecycleError::DuplicateRole`].
    pub fn register(&self, class: MachineClass, roles: &[Role], weak: bool) -> Result<()> {
        self.registry().register(&class, roles, weak)
    }

    /// Register `M` for every role it declares.
    pub fn register_machine<M: FromContext>(&self, weak: bool) -> Result<()> {
        self.register(MachineClass::of::<M>(), M::roles(), weak)
    }

    /// The class registered for `role`.
    pub fn machine_class(&self, role: Role) -> Result<MachineClass> {
        self.registry()
            .class_for(&role)
            .cloned()
            .ok_or_else(|| no_machine(&Target::Role(role)))
    }

    /// Registered roles in registration order.
    pub fn roles(&self) -> Vec<Role> {
        self.registry().roles().copied().collect()
    }

    /// Whether `role` is only filled by an overridable default.
    pub fn is_default(&self, role: Role) -> bool {
        self.registry().is_weak(&role)
    }

    /// Shared access to the machine for `target`, creating it if needed.
    pub async fn request(&self, target: impl Into<Target>) -> Result<Lease> {
        self.request_with(target, RequestOptions::default()).await
    }

    /// Access to the machine for `target` with explicit options.
    pub async fn request_with(
        &self,
        target: impl Into<Target>,
        options: RequestOptions,
    ) -> Result<Lease> {
        let target = target.into();
        let (class, manager) = self.resolve(&target)?;

        if options.reset && manager.is_alive() {
            debug!("resetting '{}'", class.name());
            manager.teardown().await?;
        }
        if !manager.is_alive() {
            manager.init(class.instantiate(self.clone())).await?;
        }
        manager.request(options.exclusive)
    }

    /// Request machine class `M` directly, bypassing role lookup.
    ///
    /// `M` must be registered for some role or have been instantiated in
    /// this context before.
    pub async fn request_machine<M: FromContext>(&self, options: RequestOptions) -> Result<Lease> {
        self.request_with(MachineClass::of::<M>(), options).await
    }

    fn resolve(&self, target: &Target) -> Result<(MachineClass, Arc<InstanceManager>)> {
        let mut registry = self.registry();
        let class = match target {
            Target::Role(role) => registry.class_for(role).cloned(),
            Target::Class(class) => registry.knows(class).then(|| class.clone()),
        }
        .ok_or_else(|| no_machine(target))?;

        let manager = registry.manager(&class);
        Ok((class, manager))
    }

    /// Whether an instance for `target` is alive.
    pub fn is_alive(&self, target: impl Into<Target>) -> bool {
        let target = target.into();
        self.resolve(&target)
            .map(|(_, manager)| manager.is_alive())
            .unwrap_or(false)
    }

    /// Open a scope. When the outermost scope closes, instances that are
    /// still alive are reported.
    pub fn enter(&self) -> ContextScope {
        self.inner.open_scopes.fetch_add(1, Ordering::SeqCst);
        ContextScope { ctx: self.clone() }
    }

    /// Start collecting leases and cleanups to be released together.
    pub fn handle(&self) -> ContextHandle {
        ContextHandle::new(self.clone())
    }

    /// Classes whose instance is alive.
    pub fn dangling(&self) -> Vec<&'static str> {
        self.registry().alive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("roles", &self.roles())
            .field("open_scopes", &self.inner.open_scopes.load(Ordering::SeqCst))
            .finish()
    }
}

fn no_machine(target: &Target) -> crate::Error {
    LifecycleError::NoMachine {
        target: target.to_string(),
    }
    .into()
}

/// An open [`Context`] scope; see [`Context::enter`].
#[must_use = "the scope closes when dropped"]
pub struct ContextScope {
    ctx: Context,
}

impl ContextScope {
    /// The scoped context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if self.ctx.inner.open_scopes.fetch_sub(1, Ordering::SeqCst) == 1 {
            for class in self.ctx.dangling() {
                warn!("found dangling '{}' instance in this context", class);
            }
        }
    }
}
