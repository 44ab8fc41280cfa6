//! Differentiable point-to-point transfers
//!
//! [`send`] and [`recv`] move an activation tensor between two processes
//! during forward and move its gradient back along the same edge during
//! backward. Both return a [`Variable`] so the transfer participates in
//! the local graph:
//!
//! - `send` returns a zero-size dummy whose backward blocks on the peer's
//!   gradient. Holding the dummy (or threading it onward as an obligation)
//!   is what keeps the local backward pass aware that a remote consumer
//!   still owes a gradient.
//! - `recv` returns the received activation; its backward ships the
//!   incoming gradient straight back to the sender.
//!
//! An obligation variable accepted by either constructor is wired in as an
//! extra input receiving a zero gradient, so a single backward pass visits
//! every transfer recorded on this process even when the data flow alone
//! would not connect them.

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::graph::{Op, Variable};
use crate::transport::Transport;
use crate::wire;

/// Send `x`'s value to `dst` immediately and record the backward half.
///
/// The returned dummy variable must stay reachable from whatever the
/// caller eventually runs backward on; dropping it leaves the peer's
/// gradient send unanswered.
pub fn send(
    x: &Variable,
    transport: &Arc<dyn Transport>,
    dst: usize,
    obligation: Option<Variable>,
) -> Result<Variable> {
    let bytes = wire::encode(x.data(), transport.max_message_len())?;
    transport.send(dst, bytes)?;

    let mut inputs = vec![x.clone()];
    inputs.extend(obligation);
    let dummy = Tensor::zeros((), x.data().dtype(), x.data().device())?;
    Ok(Variable::from_op(
        dummy,
        Box::new(SendOp { transport: transport.clone(), peer: dst }),
        inputs,
    ))
}

/// Block until a tensor arrives from `src` and wrap it as a variable whose
/// backward returns the gradient to the sender.
pub fn recv(
    transport: &Arc<dyn Transport>,
    src: usize,
    obligation: Option<Variable>,
) -> Result<Variable> {
    let bytes = transport.recv(src)?;
    let data = wire::decode(&bytes)?;

    let inputs: Vec<Variable> = obligation.into_iter().collect();
    Ok(Variable::from_op(
        data,
        Box::new(RecvOp { transport: transport.clone(), peer: src }),
        inputs,
    ))
}

/// Attach `pointer`'s pending transfer obligations to `y` without changing
/// `y`'s value, so one backward from the merged variable settles both the
/// local output's gradient and the recorded transfers.
pub fn merge(y: &Variable, pointer: Variable) -> Variable {
    let data = y.data().clone();
    Variable::from_op(data, Box::new(MergeOp), vec![y.clone(), pointer])
}

struct SendOp {
    transport: Arc<dyn Transport>,
    peer: usize,
}

impl Op for SendOp {
    fn name(&self) -> &'static str {
        "send"
    }

    fn backward(&self, inputs: &[Variable], _grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        // The gradient for the sent activation comes from the remote
        // consumer, not from the dummy output.
        let bytes = self.transport.recv(self.peer)?;
        let grad = wire::decode(&bytes)?;
        let sent = inputs[0].data();
        if grad.dims() != sent.dims() {
            return Err(Error::Protocol(format!(
                "gradient from rank {} has shape {:?}, sent activation was {:?}",
                self.peer,
                grad.dims(),
                sent.dims()
            )));
        }
        let mut grads = vec![Some(grad)];
        for obligation in &inputs[1..] {
            grads.push(Some(zeros_like(obligation.data())?));
        }
        Ok(grads)
    }
}

struct RecvOp {
    transport: Arc<dyn Transport>,
    peer: usize,
}

impl Op for RecvOp {
    fn name(&self) -> &'static str {
        "recv"
    }

    fn backward(&self, inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        // Return the gradient to the sender before releasing any chained
        // obligation, so the peer unblocks first.
        let bytes = wire::encode(grad, self.transport.max_message_len())?;
        self.transport.send(self.peer, bytes)?;
        inputs
            .iter()
            .map(|obligation| Ok(Some(zeros_like(obligation.data())?)))
            .collect()
    }
}

struct MergeOp;

impl Op for MergeOp {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn backward(&self, inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad.clone()), Some(zeros_like(inputs[1].data())?)])
    }
}

fn zeros_like(t: &Tensor) -> Result<Tensor> {
    Ok(Tensor::zeros(t.shape(), t.dtype(), t.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops;
    use crate::transport::LocalMesh;
    use candle_core::Device;

    fn leaf(values: Vec<f32>) -> Variable {
        let len = values.len();
        Variable::new(Tensor::from_vec(values, len, &Device::Cpu).unwrap())
    }

    #[test]
    fn test_send_recv_carries_value_and_gradient() {
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let x = leaf(vec![1.0, 2.0]);
                let handle = send(&x, &t0, 1, None).unwrap();
                // Backward on the dummy blocks until rank 1 replies.
                handle.backward().unwrap();
                assert_eq!(
                    x.grad().unwrap().to_vec1::<f32>().unwrap(),
                    vec![2.0, 2.0]
                );
            });
            s.spawn(move || {
                let r = recv(&t1, 0, None).unwrap();
                assert_eq!(r.data().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
                // loss = sum(2 * r) so dloss/dr = 2, shipped back to rank 0.
                let loss = ops::sum_all(&ops::scale(&r, 2.0).unwrap()).unwrap();
                loss.backward().unwrap();
            });
        });
    }

    #[test]
    fn test_send_backward_rejects_mismatched_gradient() {
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let x = leaf(vec![1.0, 2.0, 3.0]);
                let handle = send(&x, &t0, 1, None).unwrap();
                let err = handle.backward().unwrap_err();
                assert!(matches!(err, Error::Protocol(_)));
            });
            s.spawn(move || {
                // Consume the activation, then reply with a wrongly shaped
                // gradient and exit without waiting.
                let _ = t1.recv(0).unwrap();
                let bad = Tensor::from_vec(vec![1.0f32], 1, &Device::Cpu).unwrap();
                let bytes = wire::encode(&bad, t1.max_message_len()).unwrap();
                t1.send(0, bytes).unwrap();
            });
        });
    }

    #[test]
    fn test_merge_keeps_value_and_routes_gradient() {
        let mut transports = LocalMesh::build_uniform(2);
        let t1 = Arc::new(transports.remove(1)) as Arc<dyn Transport>;
        let t0 = Arc::new(transports.remove(0)) as Arc<dyn Transport>;

        std::thread::scope(|s| {
            s.spawn(move || {
                let x = leaf(vec![4.0]);
                let y = ops::scale(&x, 3.0).unwrap();
                let u = leaf(vec![7.0]);
                let pointer = send(&u, &t0, 1, None).unwrap();

                let merged = merge(&y, pointer);
                assert_eq!(merged.data().to_vec1::<f32>().unwrap(), vec![12.0]);

                merged.backward().unwrap();
                // The local path gets the real gradient.
                assert_eq!(x.grad().unwrap().to_vec1::<f32>().unwrap(), vec![3.0]);
                // The transfer was settled with the remote gradient.
                assert_eq!(u.grad().unwrap().to_vec1::<f32>().unwrap(), vec![5.0]);
            });
            s.spawn(move || {
                let r = recv(&t1, 0, None).unwrap();
                let loss = ops::sum_all(&ops::scale(&r, 5.0).unwrap()).unwrap();
                loss.backward().unwrap();
            });
        });
    }
}
