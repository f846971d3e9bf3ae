//! Several leases released as one.

use std::future::Future;

use log::warn;

use super::{Context, RequestOptions, Target};
use crate::error::Result;
use crate::lifecycle::ReleaseStack;
use crate::machine::{MachineClass, SharedMachine};
use crate::role::{BOARD_LINUX, BOARD_UBOOT, LAB_HOST, Role};

/// Collects leases (and any other cleanup) so that a test needing several
/// machines can give them all back at once, newest first.
///
/// ```rust,no_run
/// use labrig::Context;
/// use labrig::role::{BUILD_HOST, LAB_HOST};
///
/// # async fn example(ctx: Context) -> Result<(), labrig::Error> {
/// let mut cx = ctx.handle();
/// let lab = cx.request(LAB_HOST).await?;
/// let build = cx.request(BUILD_HOST).await?;
/// // ... drive both ...
/// # drop((lab, build));
/// cx.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ContextHandle {
    ctx: Context,
    releases: ReleaseStack,
    closed: bool,
}

impl ContextHandle {
    pub(super) fn new(ctx: Context) -> Self {
        Self {
            ctx,
            releases: ReleaseStack::new(),
            closed: false,
        }
    }

    /// The underlying context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Shared access to the machine for `target`, held until [`close`](Self::close).
    pub async fn request(&mut self, target: impl Into<Target>) -> Result<SharedMachine> {
        self.request_with(target, RequestOptions::default()).await
    }

    /// Like [`request`](Self::request), with explicit options.
    pub async fn request_with(
        &mut self,
        target: impl Into<Target>,
        options: RequestOptions,
    ) -> Result<SharedMachine> {
        let target = target.into();
        let label = format!("release {}", target);
        let lease = self.ctx.request_with(target, options).await?;
        let machine = lease.machine();
        self.releases.push(label, lease.release());
        Ok(machine)
    }

    /// Shared access to the lab host.
    pub async fn lab(&mut self) -> Result<SharedMachine> {
        self.request(LAB_HOST).await
    }

    /// The board's bootloader shell, with the lab host acquired first.
    pub async fn uboot(&mut self) -> Result<SharedMachine> {
        self.request_chain(&[LAB_HOST], BOARD_UBOOT).await
    }

    /// The board's Linux shell, with the lab host acquired first.
    pub async fn linux(&mut self) -> Result<SharedMachine> {
        self.request_chain(&[LAB_HOST], BOARD_LINUX).await
    }

    /// Request each of `first` in order, then `target`.
    ///
    /// Everything stays held until [`close`](Self::close), so the machines
    /// in `first` outlive `target`.
    pub async fn request_chain(&mut self, first: &[Role], target: Role) -> Result<SharedMachine> {
        for role in first {
            self.request(*role).await?;
        }
        self.request(target).await
    }

    /// The class registered for `role`.
    pub fn machine_class(&self, role: Role) -> Result<MachineClass> {
        self.ctx.machine_class(role)
    }

    /// Run `action` when the handle closes.
    pub fn defer<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.releases.push(label, action);
    }

    /// Release everything, newest first.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        std::mem::take(&mut self.releases).run().await
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if !self.closed && !self.releases.is_empty() {
            warn!("context handle dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::testing::{MockBoard, MockLab, SERIAL, record, take_events};
    use crate::role::{BOARD_LINUX, LAB_HOST};
    use crate::Context;

    #[tokio::test]
    async fn test_close_releases_in_reverse_order() {
        let _serial = SERIAL.lock().await;
        let ctx = Context::new();
        ctx.register_machine::<MockLab>(false).unwrap();
        ctx.register_machine::<MockBoard>(false).unwrap();
        take_events();

        let mut cx = ctx.handle();
        let lab = cx.request(LAB_HOST).await.unwrap();
        cx.defer("note", async {
            record("deferred");
            Ok(())
        });
        let board = cx.request(BOARD_LINUX).await.unwrap();
        assert_eq!(board.lock().await.name(), "mock-board");
        assert_eq!(lab.lock().await.name(), "mock-lab");

        cx.close().await.unwrap();
        assert_eq!(
            take_events(),
            vec![
                "lab init",
                "board init",
                "board deinit status=1",
                "board releases lab",
                "deferred",
                "lab deinit status=1",
            ]
        );
        assert!(ctx.dangling().is_empty());
    }

    #[tokio::test]
    async fn test_linux_holds_lab_until_close() {
        let _serial = SERIAL.lock().await;
        let ctx = Context::new();
        ctx.register_machine::<MockLab>(false).unwrap();
        ctx.register_machine::<MockBoard>(false).unwrap();
        take_events();

        let mut cx = ctx.handle();
        let linux = cx.linux().await.unwrap();
        assert_eq!(linux.lock().await.name(), "mock-board");
        assert!(ctx.is_alive(LAB_HOST));

        cx.close().await.unwrap();
        assert_eq!(
            take_events(),
            vec![
                "lab init",
                "board init",
                "board deinit status=1",
                "board releases lab",
                "lab deinit status=1",
            ]
        );
    }
}
