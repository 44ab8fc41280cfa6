//! Transport abstraction
//!
//! The crate treats the underlying byte transport as an opaque collaborator:
//! anything that can move a message between two ranks and report a stable
//! host identifier satisfies [`Transport`]. Collective operations are not
//! part of the trait; they are built once, over point-to-point transfers, by
//! [`Group`], so every backend gets identical collective semantics.
//!
//! [`local::LocalMesh`] provides the in-process backend used by tests and by
//! single-host thread-per-worker deployments.

pub mod local;

pub use local::{LocalMesh, LocalTransport};

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::wire;

/// Point-to-point byte transport over a flat set of ranks.
///
/// Implementations must be usable from the owning worker's single control
/// thread; `recv` blocks until the matching `send` has been issued by the
/// peer. A missing peer message blocks indefinitely — ordering bugs manifest
/// as hangs, not errors, and are diagnosed externally.
pub trait Transport: Send + Sync {
    /// This process's rank within the global group, in `[0, size)`.
    fn rank(&self) -> usize;

    /// Total number of ranks in the global group.
    fn size(&self) -> usize;

    /// Deliver one message to `dst`. Messages between a fixed (source,
    /// destination) pair are delivered in send order.
    fn send(&self, dst: usize, message: Vec<u8>) -> Result<()>;

    /// Block until a message from `src` arrives.
    fn recv(&self, src: usize) -> Result<Vec<u8>>;

    /// Identifier of the physical host this rank runs on. Stable for the
    /// process lifetime and identical for co-located ranks.
    fn host_id(&self) -> Result<String>;

    /// Largest single message this transport can carry.
    fn max_message_len(&self) -> usize {
        wire::MAX_MESSAGE_LEN
    }
}

/// A subset of global ranks with collective operations.
///
/// Members are ordered by ascending global rank; the member at position 0 is
/// the group root. A `Group` is created for the ranks it spans on every
/// participating process, and paired collective calls must be issued by all
/// members — the wire headers let the root detect a shape or dtype mismatch,
/// which is reported as a fatal protocol error.
#[derive(Clone)]
pub struct Group {
    transport: Arc<dyn Transport>,
    members: Vec<usize>,
    pos: usize,
}

impl Group {
    /// Build a group over `members` (global ranks, ascending). The calling
    /// process's rank must be a member.
    pub fn new(transport: Arc<dyn Transport>, members: Vec<usize>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::Config("a communication group cannot be empty".to_string()));
        }
        if members.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "group members must be distinct and in ascending rank order".to_string(),
            ));
        }
        if let Some(&r) = members.iter().find(|&&r| r >= transport.size()) {
            return Err(Error::Config(format!(
                "rank {r} is outside the global group of size {}",
                transport.size()
            )));
        }
        let me = transport.rank();
        let pos = members.iter().position(|&r| r == me).ok_or_else(|| {
            Error::Config(format!("rank {me} is not a member of group {members:?}"))
        })?;
        Ok(Self { transport, members, pos })
    }

    /// Group spanning every rank of the transport.
    pub fn world(transport: Arc<dyn Transport>) -> Result<Self> {
        let members = (0..transport.size()).collect();
        Self::new(transport, members)
    }

    /// Position of this process inside the group.
    pub fn rank(&self) -> usize {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Global ranks of the members, ascending.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn limit(&self) -> usize {
        self.transport.max_message_len()
    }

    /// Replicate the tensor held by the member at group position `root` to
    /// every member. Returns the root's value on all members.
    pub fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        if root >= self.members.len() {
            return Err(Error::Config(format!(
                "broadcast root {root} out of range for group of size {}",
                self.members.len()
            )));
        }
        if self.members.len() == 1 {
            return Ok(tensor.clone());
        }
        if self.pos == root {
            let buf = wire::encode(tensor, self.limit())?;
            for (i, &r) in self.members.iter().enumerate() {
                if i != root {
                    self.transport.send(r, buf.clone())?;
                }
            }
            Ok(tensor.clone())
        } else {
            wire::decode(&self.transport.recv(self.members[root])?)
        }
    }

    /// Element-wise sum of every member's tensor; all members receive the
    /// result. Blocking until all members have contributed. Contributions
    /// are summed in ascending member order, so the result is deterministic
    /// up to that fixed floating-point order.
    pub fn allreduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.members.len() == 1 {
            return Ok(tensor.clone());
        }
        if self.pos == 0 {
            let mut acc = tensor.clone();
            for &r in &self.members[1..] {
                let contrib = wire::decode(&self.transport.recv(r)?)?;
                if contrib.dims() != tensor.dims() || contrib.dtype() != tensor.dtype() {
                    return Err(Error::Protocol(format!(
                        "allreduce mismatch: rank {r} contributed {:?} {:?}, root has {:?} {:?}",
                        contrib.dims(),
                        contrib.dtype(),
                        tensor.dims(),
                        tensor.dtype()
                    )));
                }
                acc = (&acc + &contrib)?;
            }
            let buf = wire::encode(&acc, self.limit())?;
            for &r in &self.members[1..] {
                self.transport.send(r, buf.clone())?;
            }
            Ok(acc)
        } else {
            let root = self.members[0];
            self.transport.send(root, wire::encode(tensor, self.limit())?)?;
            wire::decode(&self.transport.recv(root)?)
        }
    }

    /// Gather one opaque byte payload from every member; all members receive
    /// the full list in ascending member order.
    pub fn allgather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        if self.members.len() == 1 {
            return Ok(vec![payload]);
        }
        if self.pos == 0 {
            let mut frames = Vec::with_capacity(self.members.len());
            frames.push(payload);
            for &r in &self.members[1..] {
                frames.push(self.transport.recv(r)?);
            }
            let packed = wire::encode_frames(&frames);
            for &r in &self.members[1..] {
                self.transport.send(r, packed.clone())?;
            }
            Ok(frames)
        } else {
            let root = self.members[0];
            self.transport.send(root, payload)?;
            wire::decode_frames(&self.transport.recv(root)?)
        }
    }

    /// Block until every member has reached the barrier. Implemented as a
    /// dummy scalar allreduce, the usual trick for transports without a
    /// native barrier.
    pub fn barrier(&self) -> Result<()> {
        let zero = Tensor::zeros((), candle_core::DType::F32, &candle_core::Device::Cpu)?;
        self.allreduce_sum(&zero)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::local::LocalMesh;
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_group_rejects_non_member() {
        let mut mesh = LocalMesh::build_uniform(3);
        let t2: Arc<dyn Transport> = Arc::new(mesh.remove(2));
        let err = Group::new(t2, vec![0, 1]).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_group_rejects_unordered_members() {
        let mut mesh = LocalMesh::build_uniform(3);
        let t0: Arc<dyn Transport> = Arc::new(mesh.remove(0));
        assert!(Group::new(t0.clone(), vec![1, 0]).is_err());
        assert!(Group::new(t0.clone(), vec![0, 0]).is_err());
        assert!(Group::new(t0, vec![]).is_err());
    }

    #[test]
    fn test_world_allreduce_sums_all_ranks() {
        let mesh = LocalMesh::build_uniform(3);
        let results: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let rank = t.rank();
                        let transport: Arc<dyn Transport> = Arc::new(t);
                        let group = Group::world(transport).unwrap();
                        let local = Tensor::from_vec(
                            vec![rank as f32, 1.0, 2.0 * rank as f32],
                            3,
                            &Device::Cpu,
                        )
                        .unwrap();
                        let sum = group.allreduce_sum(&local).unwrap();
                        sum.to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for values in results {
            assert_eq!(values, vec![3.0, 3.0, 6.0]);
        }
    }

    #[test]
    fn test_broadcast_replicates_root_values() {
        let mesh = LocalMesh::build_uniform(4);
        let results: Vec<Vec<f32>> = std::thread::scope(|s| {
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let rank = t.rank();
                        let transport: Arc<dyn Transport> = Arc::new(t);
                        let group = Group::world(transport).unwrap();
                        let local = if rank == 0 {
                            Tensor::from_vec(vec![0.5f32, -1.5], 2, &Device::Cpu).unwrap()
                        } else {
                            Tensor::from_vec(vec![9.0f32, 9.0], 2, &Device::Cpu).unwrap()
                        };
                        group.broadcast(&local, 0).unwrap().to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for values in results {
            assert_eq!(values, vec![0.5, -1.5]);
        }
    }

    #[test]
    fn test_allreduce_shape_mismatch_is_protocol_error() {
        let mut mesh = LocalMesh::build_uniform(2);
        let t1 = mesh.remove(1);
        let t0 = mesh.remove(0);

        // Rank 1 contributes a mis-shaped tensor and exits without waiting
        // for the result, so the root's failure is observable.
        let peer = std::thread::spawn(move || {
            let bad = Tensor::zeros(5, DType::F32, &Device::Cpu).unwrap();
            let buf = crate::wire::encode(&bad, crate::wire::MAX_MESSAGE_LEN).unwrap();
            t1.send(0, buf).unwrap();
        });

        let transport: Arc<dyn Transport> = Arc::new(t0);
        let group = Group::world(transport).unwrap();
        let local = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let err = group.allreduce_sum(&local).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        peer.join().unwrap();
    }

    #[test]
    fn test_broadcast_honors_transport_message_limit() {
        let mut mesh = LocalMesh::build_uniform(2);
        let t0: Arc<dyn Transport> =
            Arc::new(mesh.remove(0).with_max_message_len(16));
        let group = Group::world(t0).unwrap();
        let big = Tensor::zeros(100, DType::F32, &Device::Cpu).unwrap();
        // The root fails before sending anything, so no peer is needed.
        let err = group.broadcast(&big, 0).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert!(err.num_split().unwrap() > 1);
    }

    #[test]
    fn test_barrier_waits_for_all_ranks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mesh = LocalMesh::build_uniform(3);
        let arrived = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for t in mesh {
                let arrived = &arrived;
                s.spawn(move || {
                    let transport: Arc<dyn Transport> = Arc::new(t);
                    let group = Group::world(transport).unwrap();
                    arrived.fetch_add(1, Ordering::SeqCst);
                    group.barrier().unwrap();
                    // The barrier cannot release before every rank arrives.
                    assert_eq!(arrived.load(Ordering::SeqCst), 3);
                });
            }
        });
    }

    #[test]
    fn test_allgather_preserves_rank_order() {
        let mesh = LocalMesh::build_uniform(3);
        let results: Vec<Vec<Vec<u8>>> = std::thread::scope(|s| {
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let rank = t.rank();
                        let transport: Arc<dyn Transport> = Arc::new(t);
                        let group = Group::world(transport).unwrap();
                        group.allgather_bytes(format!("r{rank}").into_bytes()).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for frames in results {
            assert_eq!(frames, vec![b"r0".to_vec(), b"r1".to_vec(), b"r2".to_vec()]);
        }
    }
}
