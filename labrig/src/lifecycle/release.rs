//! Ordered cleanup actions.

use std::fmt;
use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, warn};

use crate::error::Result;

/// A pending cleanup action.
pub type ReleaseAction = BoxFuture<'static, Result<()>>;

/// A stack of async cleanup actions, run in reverse order of registration.
///
/// Whatever acquired a resource pushes the action that gives it back; the
/// owner of the stack later runs everything with [`run`](Self::run).
#[derive(Default)]
pub struct ReleaseStack {
    actions: Vec<(String, ReleaseAction)>,
}

impl ReleaseStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action.
    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions.push((label.into(), action.boxed()));
    }

    /// Move all of `other`'s actions on top of this stack.
    pub fn append(&mut self, mut other: ReleaseStack) {
        self.actions.append(&mut other.actions);
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, newest first.
    ///
    /// A failing action does not stop the ones below it. The first error is
    /// returned; later ones are logged.
    pub async fn run(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some((label, action)) = self.actions.pop() {
            debug!("release: {}", label);
            if let Err(e) = action.await {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("release '{}' failed: {}", label, e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                "dropping {} release action(s) without running them: {:?}",
                self.actions.len(),
                self.actions.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>()
            );
        }
    }
}

impl fmt::Debug for ReleaseStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(label, _)| label))
            .finish()
    }
}
