//! Instance lifecycle: creation, leasing and ordered teardown.

mod lease;
mod manager;
mod release;

pub use lease::Lease;
pub use manager::{InstanceManager, TEARDOWN_STATUS};
pub use release::{ReleaseAction, ReleaseStack};
