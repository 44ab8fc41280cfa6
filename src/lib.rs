//! Multi-node distributed training primitives for candle
//!
//! Two capabilities for training across processes that may span machines:
//!
//! - **Parameter synchronization** (data parallelism): a [`Communicator`]
//!   broadcasts initial parameters and all-reduces gradients, with a
//!   hierarchical strategy that reduces within each host before touching
//!   the slower links between hosts.
//! - **Graph stitching** (model parallelism): a [`MultiNodeGraph`] runs
//!   this process's sub-graphs in order, exchanging activations with peer
//!   processes through differentiable point-to-point transfers, so one
//!   backward pass per process settles the whole distributed graph.
//!
//! # Architecture
//!
//! The crate is layered from the wire up:
//!
//! - `wire` - tensor framing for the byte transport
//! - `transport` - the byte transport trait, rank sub-groups, and their
//!   collectives
//! - `topology` - intra/inter-host rank assignment from host identifiers
//! - `comm` - the communicator strategies and their factory
//! - `graph` / `stitch` - the local autodiff graph and the multi-process
//!   stitcher built on it
//! - `optimizer` - a communicator-aware wrapper over local optimizers
//!
//! # Usage
//!
//! ```ignore
//! // Create a communicator based on config
//! let comm = create_communicator(&config, transport, Capabilities::detect())?;
//! let mut optimizer = MultiNodeOptimizer::new(comm, Sgd::new(1e-2));
//! optimizer.setup(&varmap)?;
//!
//! // In the training loop, after the backward pass:
//! let grads = loss.backward()?;
//! optimizer.update(&grads, &varmap)?;
//! ```

pub mod comm;
pub mod error;
pub mod graph;
pub mod optimizer;
pub mod stitch;
pub mod topology;
pub mod transport;
pub mod wire;

pub use comm::{
    create_communicator, Capabilities, CommConfig, CommKind, Communicator, SyncedGradient,
};
pub use error::{Error, Result};
pub use graph::Variable;
pub use optimizer::{LocalOptimizer, MultiNodeOptimizer, Sgd};
pub use stitch::{MultiNodeGraph, SubGraph};
pub use topology::Topology;
pub use transport::{Group, LocalMesh, LocalTransport, Transport};
