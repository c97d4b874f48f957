//! Kernel applier
//!
//! Executes compiled operation lists against a [`KernelBackend`] with
//! all-or-nothing semantics: every successful primitive is pushed on a rollback
//! stack, and the first failure unwinds the stack in reverse order before the
//! error is returned.

use super::error::{Error, Result};
use super::kernel::{KernelBackend, KernelOp, KernelSnapshot};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct Applier {
    kernel: Arc<dyn KernelBackend>,
}

impl Applier {
    pub fn new(kernel: Arc<dyn KernelBackend>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<dyn KernelBackend> {
        &self.kernel
    }

    /// Executes `ops` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Apply`] naming the failing op. Everything executed
    /// before it has been undone by then.
    pub fn apply(&self, ops: &[KernelOp]) -> Result<()> {
        self.run(ops.iter().cloned())
    }

    /// Undoes `ops`: executes their inverses in reverse order.
    ///
    /// Deleting a primitive that is already gone counts as success, so this is
    /// safe to repeat (recovery relies on it).
    ///
    /// # Errors
    ///
    /// Same contract as [`Applier::apply`].
    pub fn remove(&self, ops: &[KernelOp]) -> Result<()> {
        self.run(ops.iter().rev().map(KernelOp::inverse))
    }

    fn run(&self, ops: impl Iterator<Item = KernelOp>) -> Result<()> {
        let mut done: Vec<KernelOp> = Vec::new();
        for (index, op) in ops.enumerate() {
            if let Err(source) = self.kernel.execute(&op) {
                error!("Kernel op #{index} failed ({}): {source}", op.describe());
                self.unwind(&done);
                return Err(Error::Apply {
                    index,
                    op: op.describe(),
                    source: Box::new(source),
                });
            }
            done.push(op);
        }
        debug!("Executed {} kernel ops", done.len());
        Ok(())
    }

    fn unwind(&self, done: &[KernelOp]) {
        for op in done.iter().rev() {
            let undo = op.inverse();
            if let Err(e) = self.kernel.execute(&undo) {
                // Nothing more can be done here; verify will report the residue
                warn!("Rollback of '{}' failed: {e}", op.describe());
            }
        }
        if !done.is_empty() {
            debug!("Rolled back {} kernel ops", done.len());
        }
    }

    pub fn prepare(&self) -> Result<()> {
        self.kernel.prepare()
    }

    /// Clears the managed table and every managed routing entry
    pub fn reset(&self) -> Result<()> {
        self.kernel.flush_filter_table()?;
        self.kernel.flush_managed_routes()
    }

    pub fn snapshot(&self) -> Result<KernelSnapshot> {
        self.kernel.snapshot()
    }
}
