//! NCCL-backed intra-host collective
//!
//! Gives the hierarchical communicator a fast path for its intra-host
//! reduction phase: co-located ranks each drive one GPU and reduce over
//! NVLink/PCIe instead of staging through the host transport.
//!
//! # Requirements
//!
//! - CUDA 12.x
//! - NCCL library installed on the system
//! - Compile with `--features nccl`

use std::sync::{Arc, Mutex};

use candle_core::{DType, Tensor};
use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::{Comm, Id, ReduceOp};

use crate::error::{Error, Result};
use crate::transport::Group;

/// One rank's handle into the intra-host NCCL communicator. Each co-located
/// rank drives the GPU whose ordinal matches its intra-host position.
///
/// # Thread Safety
///
/// NCCL communicators are not thread safe; the Mutex serializes every
/// collective issued through this handle.
pub struct AccelChannel {
    stream: Arc<CudaStream>,
    comm: Mutex<Comm>,
}

// SAFETY: The Mutex ensures that NCCL operations are serialized
unsafe impl Send for AccelChannel {}
unsafe impl Sync for AccelChannel {}

impl AccelChannel {
    /// Join the intra-host NCCL communicator over `intra`. The group's
    /// first rank generates the NCCL unique id and distributes it through
    /// the host transport; every member must call this together.
    pub fn new(intra: &Group) -> Result<Self> {
        let local_rank = intra.rank();
        let local_size = intra.size();

        let stream = CudaContext::new(local_rank)
            .map(|ctx| ctx.default_stream())
            .map_err(|e| Error::Transport(format!("failed to create CUDA context: {e:?}")))?;

        let id = if local_rank == 0 {
            Id::new().map_err(|e| Error::Transport(format!("NCCL id creation failed: {e:?}")))?
        } else {
            Id::uninit([0; 128])
        };
        let id_bytes: Vec<u8> = id.internal().iter().map(|&b| b as u8).collect();
        let frames = intra.allgather_bytes(id_bytes)?;
        let mut internal = [0i8; 128];
        if frames[0].len() != internal.len() {
            return Err(Error::Protocol("malformed NCCL id exchange".to_string()));
        }
        for (dst, &src) in internal.iter_mut().zip(frames[0].iter()) {
            *dst = src as i8;
        }
        let id = Id::uninit(internal);

        let comm = Comm::from_rank(stream.clone(), local_rank, local_size, id)
            .map_err(|e| Error::Transport(format!("failed to create NCCL comm: {e:?}")))?;

        log::info!(
            "NCCL channel initialized: GPU {} of {} on this host",
            local_rank,
            local_size
        );

        Ok(Self {
            stream,
            comm: Mutex::new(comm),
        })
    }

    /// Sum `tensor` element-wise across the co-located ranks.
    pub fn allreduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        let dtype = tensor.dtype();
        let flat = tensor.flatten_all()?;

        match dtype {
            DType::F32 => {
                let data: Vec<f32> = flat.to_vec1()?;
                let reduced = self.allreduce_f32(&data)?;
                Ok(Tensor::from_vec(reduced, tensor.shape(), tensor.device())?)
            }
            DType::F16 | DType::BF16 => {
                // Reduce in f32 to avoid half-precision accumulation error.
                let data: Vec<f32> = flat.to_dtype(DType::F32)?.to_vec1()?;
                let reduced = self.allreduce_f32(&data)?;
                let result = Tensor::from_vec(reduced, tensor.shape(), tensor.device())?;
                Ok(result.to_dtype(dtype)?)
            }
            _ => Err(Error::Protocol(format!(
                "NCCL all-reduce not supported for dtype {dtype:?}"
            ))),
        }
    }

    fn allreduce_f32(&self, data: &[f32]) -> Result<Vec<f32>> {
        let comm = self.comm.lock().unwrap();

        let gpu_data = self
            .stream
            .clone_htod(data)
            .map_err(|e| Error::Transport(format!("failed to copy to GPU: {e:?}")))?;
        let mut output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(|e| Error::Transport(format!("failed to allocate output: {e:?}")))?;

        comm.all_reduce(&gpu_data, &mut output, &ReduceOp::Sum)
            .map_err(|e| Error::Transport(format!("NCCL all_reduce failed: {e:?}")))?;

        let result = self
            .stream
            .clone_dtoh(&output)
            .map_err(|e| Error::Transport(format!("failed to copy from GPU: {e:?}")))?;
        Ok(result)
    }
}
