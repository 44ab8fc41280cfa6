//! Parameter-synchronization communicators
//!
//! A [`Communicator`] gives the training loop two collective operations over
//! a model's parameters: `broadcast_data` replicates worker 0's values to
//! every worker once after construction, and `allreduce_grad` sums each
//! gradient across workers after the local backward pass so every worker
//! steps its optimizer with the identical total gradient.
//!
//! Three strategies implement the same capability set:
//!
//! - [`NaiveCommunicator`] — flat collectives over the whole group.
//! - [`HierarchicalCommunicator`] — reduce within each host first, combine
//!   once per host across the (slower) inter-host links, then fan the result
//!   back out. Optionally uses an accelerator-local collective for the
//!   intra-host phase (requires the `nccl` feature).
//! - [`SingleNodeCommunicator`] — exactly one process; collectives are
//!   no-ops.
//!
//! Select one at construction via [`create_communicator`]; there is no
//! runtime re-selection.

pub mod hierarchical;
pub mod naive;
pub mod single_node;

#[cfg(feature = "nccl")]
pub mod accel;

use std::str::FromStr;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Transport;

pub use hierarchical::{ChannelSet, HierarchicalCommunicator};
pub use naive::NaiveCommunicator;
pub use single_node::SingleNodeCommunicator;

/// Synced gradient: parameter name, its variable, and the summed gradient.
pub type SyncedGradient = (String, Var, candle_core::Tensor);

/// Whole-group parameter synchronization.
///
/// Both operations are blocking: they return only once the collective has
/// completed on all participants.
pub trait Communicator: Send + Sync {
    /// This process's rank within the global group.
    fn rank(&self) -> usize;

    /// Total number of workers.
    fn size(&self) -> usize;

    /// Replicate worker 0's parameter values into every worker's `VarMap`,
    /// in place. Call once after model construction, before training, to
    /// establish a consistent initial state.
    fn broadcast_data(&self, params: &VarMap) -> Result<()>;

    /// Sum gradients across all workers. candle's `GradStore` cannot be
    /// mutated, so the summed gradients are returned in the form the
    /// optimizer consumes.
    fn allreduce_grad(&self, grads: &GradStore, params: &VarMap)
        -> Result<Vec<SyncedGradient>>;
}

/// Communicator strategy selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommKind {
    /// Flat collectives, no hierarchy.
    Naive,
    /// Two-level intra/inter-host reduction.
    #[default]
    Hierarchical,
    /// Exactly one process; collectives degenerate to no-ops.
    SingleNode,
}

impl FromStr for CommKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "naive" => Ok(CommKind::Naive),
            "hierarchical" => Ok(CommKind::Hierarchical),
            "single_node" => Ok(CommKind::SingleNode),
            other => Err(Error::Config(format!(
                "unrecognized communicator: \"{other}\". Valid options: naive, hierarchical, single_node"
            ))),
        }
    }
}

/// Configuration for communicator construction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommConfig {
    /// Strategy to construct.
    #[serde(default)]
    pub kind: CommKind,

    /// Whether the hierarchical strategy should use the accelerator-local
    /// collective for its intra-host phase. `None` enables it automatically
    /// when compiled in; `Some(true)` without the capability is a fatal
    /// configuration error at construction.
    #[serde(default)]
    pub use_accel: Option<bool>,
}

/// Capabilities compiled into this build, resolved once at process start
/// and passed explicitly into construction.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// An accelerator-local collective (NCCL) is linked in.
    pub accel_collective: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Self { accel_collective: cfg!(feature = "nccl") }
    }
}

/// Construct a communicator of the configured kind over `group`.
///
/// Fatal configuration errors: a hierarchical communicator requesting the
/// accelerator collective when it is not compiled in, or a single-node
/// communicator over a group with more than one process.
pub fn create_communicator(
    config: &CommConfig,
    group: Arc<dyn Transport>,
    caps: Capabilities,
) -> Result<Box<dyn Communicator>> {
    match config.kind {
        CommKind::Naive => Ok(Box::new(NaiveCommunicator::new(group)?)),
        CommKind::SingleNode => Ok(Box::new(SingleNodeCommunicator::new(group)?)),
        CommKind::Hierarchical => Ok(Box::new(HierarchicalCommunicator::new(
            group,
            config.use_accel,
            caps,
        )?)),
    }
}

/// Parameters in name order. `VarMap` iterates in hash order, which differs
/// between processes; every collective walk must use this ordering so all
/// ranks stay in lockstep.
pub(crate) fn sorted_params(params: &VarMap) -> Vec<(String, Var)> {
    let data = params.data().lock().unwrap();
    let mut entries: Vec<(String, Var)> =
        data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}
