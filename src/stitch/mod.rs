//! Multi-process graph stitching
//!
//! A model too large (or too entangled) for one process is split into
//! sub-graphs, one set per process, and stitched back together with
//! point-to-point transfers. [`MultiNodeGraph`] holds this process's
//! ordered sub-graph bindings; its [`forward`](MultiNodeGraph::forward)
//! runs them in registration order, receiving activations before each
//! sub-graph and sending its output afterwards, while threading a pointer
//! variable through every transfer so a single local backward pass settles
//! each one.
//!
//! The counterpart processes run their own `MultiNodeGraph` with mirrored
//! bindings; both sides' registration orders must agree on the transfer
//! sequence or forward deadlocks.

pub mod p2p;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{ops, Variable, RANK_LAST};
use crate::transport::Transport;

/// One process-local component of a partitioned model.
pub trait SubGraph {
    fn forward(&self, inputs: &[Variable]) -> Result<Variable>;
}

impl<F> SubGraph for F
where
    F: Fn(&[Variable]) -> Result<Variable>,
{
    fn forward(&self, inputs: &[Variable]) -> Result<Variable> {
        self(inputs)
    }
}

struct Binding {
    f: Box<dyn SubGraph>,
    ranks_in: Option<Vec<usize>>,
    ranks_out: Option<Vec<usize>>,
}

/// This process's share of a model partitioned across the group.
pub struct MultiNodeGraph {
    transport: Arc<dyn Transport>,
    bindings: Vec<Binding>,
}

impl MultiNodeGraph {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, bindings: Vec::new() }
    }

    /// Register the next sub-graph in this process's forward order.
    ///
    /// `ranks_in` names the peers whose activations are received and summed
    /// into the sub-graph's single input; `None` means the sub-graph reads
    /// the caller's forward inputs directly. `ranks_out` names the peers
    /// the output is sent to; `None` marks the output as this process's
    /// model output, which at most one binding may claim.
    pub fn add_link(
        &mut self,
        f: impl SubGraph + 'static,
        ranks_in: Option<Vec<usize>>,
        ranks_out: Option<Vec<usize>>,
    ) -> Result<()> {
        let me = self.transport.rank();
        let size = self.transport.size();
        for (label, ranks) in [("ranks_in", &ranks_in), ("ranks_out", &ranks_out)] {
            if let Some(ranks) = ranks {
                if ranks.is_empty() {
                    return Err(Error::Config(format!(
                        "{label} must name at least one rank; use None for no transfer"
                    )));
                }
                if ranks.contains(&me) {
                    return Err(Error::Config(format!(
                        "cannot specify own rank {me} in {label}"
                    )));
                }
                if let Some(&bad) = ranks.iter().find(|&&r| r >= size) {
                    return Err(Error::Config(format!(
                        "{label} rank {bad} is out of range for a group of {size}"
                    )));
                }
            }
        }
        if ranks_out.is_none()
            && self.bindings.iter().any(|b| b.ranks_out.is_none())
        {
            return Err(Error::Config(
                "only one sub-graph may produce the model output (ranks_out of None)"
                    .to_string(),
            ));
        }

        self.bindings.push(Binding { f: Box::new(f), ranks_in, ranks_out });
        Ok(())
    }

    /// Run this process's sub-graphs in order, performing their transfers.
    ///
    /// Returns the model output if one of the bindings claims it, otherwise
    /// a pointer variable standing in for this process's pending transfers.
    /// Either way, running backward on the returned variable settles every
    /// transfer this call recorded, in a deadlock-free order with respect
    /// to the peer processes doing the same.
    pub fn forward(&self, inputs: &[Variable]) -> Result<Variable> {
        let mut y: Option<Variable> = None;
        let mut pointer: Option<Variable> = None;

        for binding in &self.bindings {
            let out = match &binding.ranks_in {
                None => binding.f.forward(inputs)?,
                Some(ranks_in) => {
                    let mut x: Option<Variable> = None;
                    for &src in ranks_in {
                        let obligation = pointer.take();
                        let carried = obligation.is_some();
                        let received = p2p::recv(&self.transport, src, obligation)?;
                        // A receive that carries the obligation for earlier
                        // transfers must run its backward after every other
                        // ready node, or two processes can end up waiting on
                        // each other's gradient.
                        if carried {
                            if let Some(node) = received.creator() {
                                node.set_rank(RANK_LAST);
                            }
                        }
                        x = Some(match x {
                            None => received,
                            Some(acc) => ops::add(&acc, &received)?,
                        });
                    }
                    // ranks_in is non-empty, checked at registration.
                    let x = x.ok_or_else(|| {
                        Error::Config("ranks_in must name at least one rank".to_string())
                    })?;
                    binding.f.forward(&[x])?
                }
            };

            match &binding.ranks_out {
                Some(ranks_out) => {
                    for &dst in ranks_out {
                        pointer =
                            Some(p2p::send(&out, &self.transport, dst, pointer.take())?);
                    }
                }
                None => {
                    y = Some(out.clone());
                    pointer = Some(out);
                }
            }
        }

        match (y, pointer) {
            (Some(y), Some(p)) => {
                if y.same_variable(&p) {
                    // The final sub-graph produced the model output.
                    Ok(y)
                } else {
                    // An intermediate sub-graph produced it; later transfers
                    // still need a path into the backward pass.
                    Ok(p2p::merge(&y, p))
                }
            }
            (Some(y), None) => Ok(y),
            (None, Some(p)) => Ok(p),
            (None, None) => Err(Error::Config("graph has no bindings".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalMesh;
    use candle_core::{Device, Tensor};

    fn leaf(values: Vec<f32>) -> Variable {
        let len = values.len();
        Variable::new(Tensor::from_vec(values, len, &Device::Cpu).unwrap())
    }

    fn scale_by(factor: f64) -> impl Fn(&[Variable]) -> Result<Variable> {
        move |inputs: &[Variable]| ops::scale(&inputs[0], factor)
    }

    #[test]
    fn test_single_binding_matches_direct_invocation() {
        let mut transports = LocalMesh::build_uniform(1);
        let transport = Arc::new(transports.remove(0)) as Arc<dyn Transport>;
        let mut graph = MultiNodeGraph::new(transport);
        graph.add_link(scale_by(2.0), None, None).unwrap();

        let x = leaf(vec![1.0, 2.0, 3.0]);
        let y = graph.forward(&[x.clone()]).unwrap();
        assert_eq!(y.data().to_vec1::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);

        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_registration_errors() {
        let mut transports = LocalMesh::build_uniform(2);
        let transport = Arc::new(transports.remove(0)) as Arc<dyn Transport>;
        let mut graph = MultiNodeGraph::new(transport);

        // Own rank in a transfer set.
        let err = graph.add_link(scale_by(1.0), Some(vec![0]), None).unwrap_err();
        assert!(err.to_string().contains("own rank"));

        // Empty transfer set.
        let err = graph
            .add_link(scale_by(1.0), None, Some(vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Out-of-range peer.
        let err = graph
            .add_link(scale_by(1.0), None, Some(vec![5]))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        // Two output bindings.
        graph.add_link(scale_by(1.0), None, None).unwrap();
        let err = graph.add_link(scale_by(1.0), None, None).unwrap_err();
        assert!(err.to_string().contains("model output"));
    }

    #[test]
    fn test_forward_without_bindings_fails() {
        let mut transports = LocalMesh::build_uniform(1);
        let transport = Arc::new(transports.remove(0)) as Arc<dyn Transport>;
        let graph = MultiNodeGraph::new(transport);
        let err = graph.forward(&[leaf(vec![1.0])]).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_two_rank_pipeline() {
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t0);
                graph.add_link(scale_by(2.0), None, Some(vec![1])).unwrap();

                let x = leaf(vec![1.0, 2.0]);
                let pointer = graph.forward(&[x.clone()]).unwrap();
                pointer.backward().unwrap();
                // d(3 * 2x)/dx = 6, received through the transfer.
                assert_eq!(
                    x.grad().unwrap().to_vec1::<f32>().unwrap(),
                    vec![6.0, 6.0]
                );
            });
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t1);
                graph.add_link(scale_by(3.0), Some(vec![0]), None).unwrap();

                let y = graph.forward(&[]).unwrap();
                assert_eq!(y.data().to_vec1::<f32>().unwrap(), vec![6.0, 12.0]);
                y.backward().unwrap();
            });
        });
    }

    #[test]
    fn test_round_trip_cycle() {
        // Rank 0 sends through rank 1 and receives the result back, so the
        // full pipeline computes 5 * 3 * 2 * x on rank 0.
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t0);
                graph.add_link(scale_by(2.0), None, Some(vec![1])).unwrap();
                graph.add_link(scale_by(5.0), Some(vec![1]), None).unwrap();

                let x = leaf(vec![1.0, 2.0]);
                let y = graph.forward(&[x.clone()]).unwrap();
                assert_eq!(y.data().to_vec1::<f32>().unwrap(), vec![30.0, 60.0]);

                y.backward().unwrap();
                assert_eq!(
                    x.grad().unwrap().to_vec1::<f32>().unwrap(),
                    vec![30.0, 30.0]
                );
            });
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t1);
                graph.add_link(scale_by(3.0), Some(vec![0]), Some(vec![0])).unwrap();

                let pointer = graph.forward(&[]).unwrap();
                pointer.backward().unwrap();
            });
        });
    }

    #[test]
    fn test_multi_source_receive_sums_in_order() {
        // Ranks 0 and 1 both feed rank 2's binding, whose input is the
        // element-wise sum of the two activations, so the full pipeline
        // computes 10 * (2x + 3u) and each sender gets its own gradient.
        let mut transports = LocalMesh::build_uniform(3);
        let t2 = Arc::new(transports.remove(2)) as Arc<dyn Transport>;
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t0);
                graph.add_link(scale_by(2.0), None, Some(vec![2])).unwrap();

                let x = leaf(vec![1.0, 2.0]);
                let pointer = graph.forward(&[x.clone()]).unwrap();
                pointer.backward().unwrap();
                // d(10 * 2x)/dx = 20.
                assert_eq!(
                    x.grad().unwrap().to_vec1::<f32>().unwrap(),
                    vec![20.0, 20.0]
                );
            });
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t1);
                graph.add_link(scale_by(3.0), None, Some(vec![2])).unwrap();

                let u = leaf(vec![1.0, 2.0]);
                let pointer = graph.forward(&[u.clone()]).unwrap();
                pointer.backward().unwrap();
                // d(10 * 3u)/du = 30.
                assert_eq!(
                    u.grad().unwrap().to_vec1::<f32>().unwrap(),
                    vec![30.0, 30.0]
                );
            });
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t2);
                graph.add_link(scale_by(10.0), Some(vec![0, 1]), None).unwrap();

                let y = graph.forward(&[]).unwrap();
                // 10 * (2 + 3) * [1, 2].
                assert_eq!(y.data().to_vec1::<f32>().unwrap(), vec![50.0, 100.0]);
                y.backward().unwrap();
            });
        });
    }

    #[test]
    fn test_intermediate_output_merges_pending_transfers() {
        // Rank 0's first binding claims the model output; its second keeps
        // exchanging with rank 1, so forward returns a merge of the two.
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t0);
                graph.add_link(scale_by(2.0), None, None).unwrap();
                graph.add_link(scale_by(4.0), Some(vec![1]), Some(vec![1])).unwrap();

                let x = leaf(vec![1.0]);
                let y = graph.forward(&[x.clone()]).unwrap();
                // The merge carries the model output's value.
                assert_eq!(y.data().to_vec1::<f32>().unwrap(), vec![2.0]);

                y.backward().unwrap();
                assert_eq!(x.grad().unwrap().to_vec1::<f32>().unwrap(), vec![2.0]);
            });
            s.spawn(move || {
                let mut graph = MultiNodeGraph::new(t1);
                let u = leaf(vec![1.0]);
                let u_in = u.clone();
                graph
                    .add_link(
                        move |_: &[Variable]| ops::scale(&u_in, 3.0),
                        None,
                        Some(vec![0]),
                    )
                    .unwrap();
                graph.add_link(scale_by(5.0), Some(vec![0]), None).unwrap();

                let y = graph.forward(&[]).unwrap();
                y.backward().unwrap();
                // Gradient path: d(5 * 4 * 3u)/du with the rank 0 output
                // contributing nothing to u.
                assert_eq!(u.grad().unwrap().to_vec1::<f32>().unwrap(), vec![60.0]);
            });
        });
    }
}
