//! Communicator-aware optimizer wrapper
//!
//! [`MultiNodeOptimizer`] wraps any [`LocalOptimizer`] so the training loop
//! stays single-node shaped: `setup` replicates the initial parameters and
//! `update` sums gradients across workers before the wrapped optimizer
//! steps. Every worker therefore applies the identical update and the
//! replicas never drift.
//!
//! The local optimizers here take explicit gradient tensors rather than a
//! `GradStore`, because the store cannot be modified after the collective.

use candle_core::backprop::GradStore;
use candle_nn::VarMap;

use crate::comm::{Communicator, SyncedGradient};
use crate::error::Result;

/// An optimizer step over explicitly provided gradients.
pub trait LocalOptimizer {
    fn step(&mut self, grads: &[SyncedGradient]) -> Result<()>;
}

/// Plain stochastic gradient descent.
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

impl LocalOptimizer for Sgd {
    fn step(&mut self, grads: &[SyncedGradient]) -> Result<()> {
        for (_, var, grad) in grads {
            let update = grad.affine(self.lr, 0.0)?;
            var.set(&(var.as_tensor() - &update)?)?;
        }
        Ok(())
    }
}

/// Couples a local optimizer with a communicator.
pub struct MultiNodeOptimizer<O> {
    comm: Box<dyn Communicator>,
    inner: O,
}

impl<O: LocalOptimizer> MultiNodeOptimizer<O> {
    pub fn new(comm: Box<dyn Communicator>, inner: O) -> Self {
        Self { comm, inner }
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    /// Replicate worker 0's parameters so training starts from one state.
    pub fn setup(&self, params: &VarMap) -> Result<()> {
        self.comm.broadcast_data(params)
    }

    /// Sum gradients across workers, then step the wrapped optimizer with
    /// the totals.
    pub fn update(&mut self, grads: &GradStore, params: &VarMap) -> Result<()> {
        let synced = self.comm.allreduce_grad(grads, params)?;
        self.inner.step(&synced)
    }
}
