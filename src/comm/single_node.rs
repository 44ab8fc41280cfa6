//! Degenerate communicator for a lone process.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_nn::VarMap;

use crate::error::{Error, Result};
use crate::transport::Transport;

use super::{sorted_params, Communicator, SyncedGradient};

/// Keeps the `Communicator` interface available when the process group has
/// exactly one member, so the training loop is identical whether or not it
/// runs distributed. Broadcast is a no-op and allreduce passes each local
/// gradient through unchanged.
pub struct SingleNodeCommunicator {
    transport: Arc<dyn Transport>,
}

impl SingleNodeCommunicator {
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        if transport.size() != 1 {
            return Err(Error::Config(format!(
                "single_node communicator requires exactly one process, got {}",
                transport.size()
            )));
        }
        log::info!("single-node communicator initialized");
        Ok(Self { transport })
    }
}

impl Communicator for SingleNodeCommunicator {
    fn rank(&self) -> usize {
        self.transport.rank()
    }

    fn size(&self) -> usize {
        self.transport.size()
    }

    fn broadcast_data(&self, _params: &VarMap) -> Result<()> {
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
                synced.push((name, var, grad.clone()));
            }
        }
        Ok(synced)
    }
}
