//! The machine contract.
//!
//! A machine is anything test code drives: a shell on the lab host, a
//! board's serial console, a bootloader. The framework only needs a small
//! surface from it; the rest is up to the implementation.

mod local;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::channel::Channel;
use crate::context::Context;
use crate::error::{LifecycleError, Result};
use crate::lifecycle::ReleaseStack;
use crate::role::Role;

pub use local::LocalShell;

/// A live machine instance, as held by an instance manager.
pub type SharedMachine = Arc<tokio::sync::Mutex<Box<dyn Machine>>>;

/// Behavior every machine provides to the framework.
#[async_trait]
pub trait Machine: Send + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Exit status of the machine's current use. Zero means a clean exit.
    fn exit_status(&self) -> i32;

    /// Set the exit status; a forced teardown sets `1`.
    fn set_exit_status(&mut self, status: i32);

    /// The machine's channel, if it has one.
    fn channel_mut(&mut self) -> Option<&mut Channel> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Bring the machine down. Runs before any release action registered
    /// while the machine was built.
    async fn deinit(&mut self) -> Result<()> {
        Ok(())
    }
}

impl dyn Machine {
    /// Access the machine as its concrete type.
    pub fn downcast_ref<M: Machine>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    /// Mutable access to the machine as its concrete type.
    pub fn downcast_mut<M: Machine>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut()
    }

    /// Like [`downcast_mut`](Self::downcast_mut), failing with a typed error.
    pub fn try_downcast_mut<M: Machine>(&mut self) -> Result<&mut M> {
        let found = self.name().to_string();
        self.downcast_mut().ok_or_else(|| {
            LifecycleError::TypeMismatch {
                expected: std::any::type_name::<M>().to_string(),
                found,
            }
            .into()
        })
    }
}

/// How a machine class is built from a [`Context`].
///
/// `from_context` may request other machines from the context (a board
/// typically needs the lab host it is attached to). Everything it acquires
/// that must be given back goes into the returned release stack.
#[async_trait]
pub trait FromContext: Machine + Sized {
    /// Class name used in diagnostics.
    const NAME: &'static str;

    /// Roles an instance of this class can fill.
    fn roles() -> &'static [Role];

    /// Build a live instance.
    async fn from_context(ctx: Context) -> Result<Scoped<Self>>;
}

/// A value together with the cleanup that undoes its acquisition.
#[derive(Debug)]
pub struct Scoped<T> {
    pub value: T,
    pub releases: ReleaseStack,
}

impl<T> Scoped<T> {
    /// A value with nothing to clean up.
    pub fn new(value: T) -> Self {
        Self {
            value,
            releases: ReleaseStack::new(),
        }
    }

    /// A value with its cleanup.
    pub fn with_releases(value: T, releases: ReleaseStack) -> Self {
        Self { value, releases }
    }

    /// Transform the value, keeping the cleanup.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Scoped<U> {
        Scoped {
            value: f(self.value),
            releases: self.releases,
        }
    }
}

/// Future building a type-erased instance.
pub type MachineFuture = BoxFuture<'static, Result<Scoped<Box<dyn Machine>>>>;

type Factory = Arc<dyn Fn(Context) -> MachineFuture + Send + Sync>;

/// Type-erased descriptor of a machine class.
#[derive(Clone)]
pub struct MachineClass {
    id: TypeId,
    name: &'static str,
    roles: &'static [Role],
    factory: Factory,
}

impl MachineClass {
    /// Descriptor for `M`.
    pub fn of<M: FromContext>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: M::NAME,
            roles: M::roles(),
            factory: Arc::new(|ctx: Context| build::<M>(ctx).boxed()),
        }
    }

    /// Type id of the concrete machine.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Class name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Roles the class declares.
    pub fn roles(&self) -> &'static [Role] {
        self.roles
    }

    /// Whether the class can fill `role`, directly or through refinement.
    pub fn provides(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r.is_a(role))
    }

    /// Start building an instance bound to `ctx`.
    pub(crate) fn instantiate(&self, ctx: Context) -> MachineFuture {
        (self.factory)(ctx)
    }
}

async fn build<M: FromContext>(ctx: Context) -> Result<Scoped<Box<dyn Machine>>> {
    let scoped = M::from_context(ctx).await?;
    Ok(scoped.map(|m| Box::new(m) as Box<dyn Machine>))
}

impl PartialEq for MachineClass {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MachineClass {}

impl fmt::Debug for MachineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineClass")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable machine for lifecycle tests.

    use std::sync::Mutex;

    use once_cell::sync::Lazy;

    use super::*;
    use crate::role::{BOARD_LINUX, BOARD_UBOOT, LAB_HOST};

    /// Events recorded by test machines, in order.
    pub static EVENTS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

    /// Serializes tests that share `EVENTS`.
    pub static SERIAL: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

    pub fn record(event: impl Into<String>) {
        EVENTS.lock().unwrap().push(event.into());
    }

    pub fn take_events() -> Vec<String> {
        std::mem::take(&mut *EVENTS.lock().unwrap())
    }

    /// Minimal machine: records construction and deinit.
    #[derive(Debug)]
    pub struct MockLab {
        pub status: i32,
        pub serial: usize,
    }

    #[async_trait]
    impl Machine for MockLab {
        fn name(&self) -> &str {
            "mock-lab"
        }

        fn exit_status(&self) -> i32 {
            self.status
        }

        fn set_exit_status(&mut self, status: i32) {
            self.status = status;
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        async fn deinit(&mut self) -> Result<()> {
            record(format!("lab deinit status={}", self.status));
            Ok(())
        }
    }

    static LAB_SERIAL: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    #[async_trait]
    impl FromContext for MockLab {
        const NAME: &'static str = "MockLab";

        fn roles() -> &'static [Role] {
            &[LAB_HOST]
        }

        async fn from_context(_ctx: Context) -> Result<Scoped<Self>> {
            let serial = LAB_SERIAL.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            record("lab init");
            Ok(Scoped::new(MockLab { status: 0, serial }))
        }
    }

    /// A board that needs the lab host and holds it until it is torn down.
    #[derive(Debug)]
    pub struct MockBoard {
        pub status: i32,
    }

    #[async_trait]
    impl Machine for MockBoard {
        fn name(&self) -> &str {
            "mock-board"
        }

        fn exit_status(&self) -> i32 {
            self.status
        }

        fn set_exit_status(&mut self, status: i32) {
            self.status = status;
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        async fn deinit(&mut self) -> Result<()> {
            record(format!("board deinit status={}", self.status));
            Ok(())
        }
    }

    #[async_trait]
    impl FromContext for MockBoard {
        const NAME: &'static str = "MockBoard";

        fn roles() -> &'static [Role] {
            &[BOARD_LINUX]
        }

        async fn from_context(ctx: Context) -> Result<Scoped<Self>> {
            let lab = ctx.request(LAB_HOST).await?;
            record("board init");

            let mut releases = ReleaseStack::new();
            releases.push("release lab host", async move {
                record("board releases lab");
                lab.release().await
            });
            Ok(Scoped::with_releases(MockBoard { status: 0 }, releases))
        }
    }

    /// A bootloader shell with no dependencies.
    #[derive(Debug)]
    pub struct MockUBoot {
        pub status: i32,
    }

    #[async_trait]
    impl Machine for MockUBoot {
        fn name(&self) -> &str {
            "mock-uboot"
        }

        fn exit_status(&self) -> i32 {
            self.status
        }

        fn set_exit_status(&mut self, status: i32) {
            self.status = status;
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        async fn deinit(&mut self) -> Result<()> {
            record(format!("uboot deinit status={}", self.status));
            Ok(())
        }
    }

    #[async_trait]
    impl FromContext for MockUBoot {
        const NAME: &'static str = "MockUBoot";

        fn roles() -> &'static [Role] {
            &[BOARD_UBOOT]
        }

        async fn from_context(_ctx: Context) -> Result<Scoped<Self>> {
            record("uboot init");
            Ok(Scoped::new(MockUBoot { status: 0 }))
        }
    }

    /// A machine whose construction always fails.
    #[derive(Debug)]
    pub struct Broken;

    #[async_trait]
    impl Machine for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn exit_status(&self) -> i32 {
            0
        }

        fn set_exit_status(&mut self, _status: i32) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[async_trait]
    impl FromContext for Broken {
        const NAME: &'static str = "Broken";

        fn roles() -> &'static [Role] {
            &[BOARD_UBOOT]
        }

        async fn from_context(_ctx: Context) -> Result<Scoped<Self>> {
            Err(crate::error::ChannelError::Closed.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockBoard, MockLab};
    use super::*;
    use crate::role::{BOARD, BOARD_LINUX, BOARD_UBOOT, LAB_HOST};

    #[test]
    fn test_class_descriptor() {
        let lab = MachineClass::of::<MockLab>();
        let board = MachineClass::of::<MockBoard>();

        assert_eq!(lab.name(), "MockLab");
        assert_eq!(lab, MachineClass::of::<MockLab>());
        assert_ne!(lab, board);

        assert!(lab.provides(&LAB_HOST));
        assert!(board.provides(&BOARD_LINUX));
        assert!(board.provides(&BOARD));
        assert!(!board.provides(&BOARD_UBOOT));
    }

    #[test]
    fn test_downcast() {
        let mut machine: Box<dyn Machine> = Box::new(MockLab { status: 0, serial: 7 });
        assert_eq!(machine.downcast_ref::<MockLab>().map(|m| m.serial), Some(7));
        assert!(machine.downcast_ref::<MockBoard>().is_none());

        let err = machine.try_downcast_mut::<MockBoard>().err().unwrap();
        assert!(matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::TypeMismatch { .. })
        ));
    }
}
