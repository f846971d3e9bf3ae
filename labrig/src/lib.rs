//! # labrig
//!
//! Async core of a hardware-in-the-loop test framework.
//!
//! Test code asks a [`Context`] for machines by role (the lab host, a
//! board's Linux shell, its bootloader) and drives them through
//! prompt-synchronized [`Channel`]s running on pseudo-terminals.
//!
//! ## Features
//!
//! - Role registry with overridable defaults
//! - One live instance per machine class, with shared and exclusive leases
//! - Teardown in reverse order of acquisition, including the machines an
//!   instance depends on
//! - PTY channels that kill and reap the child's whole session on close
//! - Tail-search prompt matching over literal or regex prompts
//! - Output tee-ing into any number of sinks, with scoped attachment
//! - Logged test cases with per-test machine acquisition
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use labrig::channel::{PtyBuilder, Prompt};
//! use labrig::role::LAB_HOST;
//! use labrig::{Context, LocalShell};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), labrig::Error> {
//!     // Direct channel use
//!     let mut ch = PtyBuilder::new("python3").arg("-q").arg("-i").spawn()?;
//!     let mut py = ch.with_prompt(Prompt::literal(">>> "));
//!     py.read_until_prompt().await?;
//!     py.send_line("print(6 * 7)", true).await?;
//!     println!("{}", py.read_until_prompt().await?);
//!     drop(py);
//!     ch.close().await?;
//!
//!     // Machines through the context
//!     let ctx = Context::with_defaults();
//!     let lab = ctx.request(LAB_HOST).await?;
//!     let kernel = lab.lock_as::<LocalShell>().await?.exec("uname -r").await?;
//!     println!("{}", kernel.trim());
//!     lab.release().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod machine;
pub mod role;
pub mod testcase;

// Re-export main types for convenience
pub use channel::{Channel, ChannelConfig, Prompt, PtyBuilder};
pub use context::{Context, ContextHandle, RequestOptions};
pub use error::{ChannelError, Error, LifecycleError, Result};
pub use lifecycle::{InstanceManager, Lease, ReleaseStack};
pub use machine::{FromContext, LocalShell, Machine, MachineClass, Scoped};
pub use role::Role;
pub use testcase::{Testcase, TestcaseSummary, testcase, with_lab, with_linux, with_uboot};
