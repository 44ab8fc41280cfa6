//! Two-level intra/inter-host communicator.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::VarMap;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::topology::Topology;
use crate::transport::{Group, Transport};

use super::{sorted_params, Capabilities, Communicator, SyncedGradient};

#[cfg(feature = "nccl")]
use super::accel::AccelChannel;

/// Channels backing the two reduction levels. Built on first use, not at
/// construction, so a communicator can be created before every worker is
/// ready to participate in the channel handshake.
pub struct ChannelSet {
    /// Ranks sharing this process's host.
    pub intra: Group,
    /// One representative per host. `None` on non-representative ranks,
    /// which never touch the inter-host level directly.
    pub inter: Option<Group>,
    /// Accelerator-local collective for the intra-host phase.
    #[cfg(feature = "nccl")]
    pub accel: Option<AccelChannel>,
}

/// Reduces within each host first, combines once per host across the
/// inter-host links, then fans the combined result back out within each
/// host. Only one rank per host ever sends on the inter-host level, so the
/// slow links carry `inter_size` tensors per gradient instead of
/// `world_size`.
pub struct HierarchicalCommunicator {
    transport: Arc<dyn Transport>,
    topology: Topology,
    use_accel: bool,
    channels: OnceCell<ChannelSet>,
}

impl HierarchicalCommunicator {
    /// Resolves the host topology eagerly; channel construction is deferred
    /// to the first collective.
    ///
    /// `use_accel` of `None` enables the accelerator-local intra-host
    /// collective when the build carries it. `Some(true)` without that
    /// capability is a fatal configuration error.
    pub fn new(
        transport: Arc<dyn Transport>,
        use_accel: Option<bool>,
        caps: Capabilities,
    ) -> Result<Self> {
        let use_accel = match use_accel {
            Some(true) if !caps.accel_collective => {
                return Err(Error::Config(
                    "accelerator collective requested but the crate was not built \
                     with the 'nccl' feature; compile with --features nccl"
                        .to_string(),
                ));
            }
            Some(v) => v,
            None => caps.accel_collective,
        };

        let world = Group::world(transport.clone())?;
        let topology = Topology::resolve(&world)?;
        log::info!(
            "hierarchical communicator initialized: rank {} of {} (host {}/{}, local {}/{})",
            transport.rank(),
            transport.size(),
            topology.inter_rank,
            topology.inter_size,
            topology.intra_rank,
            topology.intra_size,
        );

        Ok(Self {
            transport,
            topology,
            use_accel,
            channels: OnceCell::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether the intra-host phase will run on the accelerator collective.
    pub fn accel_enabled(&self) -> bool {
        self.use_accel
    }

    /// The lazily built channel set. The first call on each rank performs
    /// the channel handshake; all ranks must reach it together.
    fn channels(&self) -> Result<&ChannelSet> {
        self.channels.get_or_try_init(|| {
            let intra = Group::new(
                self.transport.clone(),
                self.topology.intra_members().to_vec(),
            )?;
            let inter = if self.topology.is_representative() {
                Some(Group::new(
                    self.transport.clone(),
                    self.topology.representatives().to_vec(),
                )?)
            } else {
                None
            };
            #[cfg(feature = "nccl")]
            let accel = if self.use_accel {
                Some(AccelChannel::new(&intra)?)
            } else {
                None
            };
            Ok(ChannelSet {
                intra,
                inter,
                #[cfg(feature = "nccl")]
                accel,
            })
        })
    }

    fn intra_allreduce(&self, channels: &ChannelSet, tensor: &Tensor) -> Result<Tensor> {
        #[cfg(feature = "nccl")]
        if let Some(accel) = &channels.accel {
            return accel.allreduce_sum(tensor);
        }
        channels.intra.allreduce_sum(tensor)
    }
}

impl Communicator for HierarchicalCommunicator {
    fn rank(&self) -> usize {
        self.transport.rank()
    }

    fn size(&self) -> usize {
        self.transport.size()
    }

    fn broadcast_data(&self, params: &VarMap) -> Result<()> {
        let channels = self.channels()?;
        for (_, var) in sorted_params(params) {
            // Global rank 0 is always its host's representative, so one hop
            // across hosts and one hop within each host reaches everyone.
            let mut value = var.as_tensor().clone();
            if let Some(inter) = &channels.inter {
                value = inter.broadcast(&value, 0)?;
            }
            let value = channels.intra.broadcast(&value, 0)?;
            if self.transport.rank() != 0 {
                var.set(&value)?;
            }
        }
        Ok(())
    }

    fn allreduce_grad(
        &self,
        grads: &GradStore,
        params: &VarMap,
    ) -> Result<Vec<SyncedGradient>> {
        let channels = self.channels()?;
        let mut synced = Vec::new();
        for (name, var) in sorted_params(params) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let mut total = self.intra_allreduce(channels, grad)?;
                if let Some(inter) = &channels.inter {
                    total = inter.allreduce_sum(&total)?;
                }
                let total = channels.intra.broadcast(&total, 0)?;
                synced.push((name, var, total));
            }
        }
        Ok(synced)
    }
}
