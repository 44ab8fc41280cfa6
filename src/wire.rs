//! Tensor wire codec
//!
//! Every point-to-point message is a length-prefixed serialized tensor:
//! a fixed header (payload byte length, dtype tag, dimension count and dims)
//! followed by the raw element values in little-endian order. Values survive
//! the process boundary bit-for-bit; there is no implicit dtype narrowing.
//!
//! `encode` enforces the transport's single-message size limit and reports
//! an oversize as [`Error::PayloadTooLarge`], which carries the minimum
//! partition count a caller would need to fit.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Default single-message ceiling, matching the 32-bit count limit common
/// to MPI-style transports.
pub const MAX_MESSAGE_LEN: usize = i32::MAX as usize;

const TAG_F32: u8 = 0;
const TAG_F64: u8 = 1;

/// Serialize a tensor, failing with `PayloadTooLarge` if the encoded message
/// would exceed `limit` bytes.
pub fn encode(tensor: &Tensor, limit: usize) -> Result<Vec<u8>> {
    let dims = tensor.dims();
    let flat = tensor.flatten_all()?;

    let (tag, payload): (u8, Vec<u8>) = match tensor.dtype() {
        DType::F32 => {
            let values: Vec<f32> = flat.to_vec1()?;
            (TAG_F32, values.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
        DType::F64 => {
            let values: Vec<f64> = flat.to_vec1()?;
            (TAG_F64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
        other => {
            return Err(Error::Protocol(format!(
                "unsupported wire dtype {other:?}; expected f32 or f64"
            )))
        }
    };

    let mut buf = Vec::with_capacity(10 + dims.len() * 8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.push(tag);
    buf.push(dims.len() as u8);
    for &d in dims {
        buf.extend_from_slice(&(d as u64).to_le_bytes());
    }
    buf.extend_from_slice(&payload);

    if buf.len() > limit {
        return Err(Error::PayloadTooLarge { size: buf.len(), limit });
    }
    Ok(buf)
}

/// Deserialize a tensor previously produced by [`encode`].
pub fn decode(buf: &[u8]) -> Result<Tensor> {
    let mut cursor = Cursor { buf, pos: 0 };

    let payload_len = cursor.read_u64()? as usize;
    let tag = cursor.read_u8()?;
    let ndims = cursor.read_u8()? as usize;
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        dims.push(cursor.read_u64()? as usize);
    }

    let payload = cursor.read_bytes(payload_len)?;
    let tensor = match tag {
        TAG_F32 => {
            if payload.len() % 4 != 0 {
                return Err(Error::Protocol("f32 payload length not a multiple of 4".to_string()));
            }
            let values: Vec<f32> = payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        TAG_F64 => {
            if payload.len() % 8 != 0 {
                return Err(Error::Protocol("f64 payload length not a multiple of 8".to_string()));
            }
            let values: Vec<f64> = payload
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_vec(values, dims, &Device::Cpu)?
        }
        other => return Err(Error::Protocol(format!("unknown wire dtype tag {other}"))),
    };
    Ok(tensor)
}

/// Pack a list of byte strings into one message (used for the host-id
/// allgather, where payloads are opaque bytes rather than tensors).
pub fn encode_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Inverse of [`encode_frames`].
pub fn decode_frames(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut cursor = Cursor { buf, pos: 0 };
    let count = cursor.read_u32()? as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cursor.read_u32()? as usize;
        frames.push(cursor.read_bytes(len)?.to_vec());
    }
    Ok(frames)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Protocol("truncated wire message".to_string()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}
