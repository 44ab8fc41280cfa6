//! Flat single-level communicator.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_nn::VarMap;

use crate::error::Result;
use crate::transport::{Group, Transport};

use super::{sorted_params, Communicator, SyncedGradient};

/// Runs every collective over the whole group in one level. Correct at any
/// scale; the hierarchical communicator exists because this one pays full
/// price on the inter-host links for every participant.
pub struct NaiveCommunicator {
    group: Group,
}

impl NaiveCommunicator {
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let group = Group::world(transport)?;
        log::info!(
            "naive communicator initialized: rank {} of {}",
            group.rank(),
            group.size()
        );
        Ok(Self { group })
    }
}

impl Communicator for NaiveCommunicator {
    fn rank(&self) -> usize {
        self.group.rank()
    }

    fn size(&self) -> usize {
        self.group.size()
    }

    fn broadcast_data(&self, params: &VarMap) -> Result<()> {
        for (_, var) in sorted_params(params) {
            let replicated = self.group.broadcast(var.as_tensor(), 0)?;
            if self.group.rank() != 0 {
                var.set(&replicated)?;
            }
        }
        Ok(())
    }

    fn allreduce_grad(
        &self,
        grads: &GradStore,
        params: &VarMap,
    ) -> Result<Vec<SyncedGradient>> {
        let mut synced = Vec::new();
        for (name, var) in sorted_params(params) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let total = self.group.allreduce_sum(grad)?;
                synced.push((name, var, total));
            }
        }
        Ok(synced)
    }
}
