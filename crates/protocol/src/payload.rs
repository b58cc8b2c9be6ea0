//! Payload builders and parsers for the plan-step traffic.
//!
//! Activations travel as raw little-endian F32 words, or as serialized Q8_0
//! blocks (`u16` scale bits then 32 code bytes per block) when the op's
//! input type calls for it. Result shards are always F32.

use byteorder::{ByteOrder, LittleEndian};
use half::f16;

use meshlm_core::{BlockQ80, BLOCK_SIZE};

use crate::constants::{ErrorCode, FrameTag};
use crate::error::{ProtocolError, Result};
use crate::frame::Frame;

/// Serialized size of one Q8_0 block.
pub const Q80_WIRE_BLOCK: usize = 2 + BLOCK_SIZE;

/// Activation operand as it is broadcast to the slices.
#[derive(Clone, Copy)]
pub enum Activation<'a> {
    F32(&'a [f32]),
    Q80(&'a [BlockQ80]),
}

pub fn plan_step(op_id: u32, activation: Activation<'_>) -> Frame {
    let body_len = match activation {
        Activation::F32(xs) => xs.len() * 4,
        Activation::Q80(blocks) => blocks.len() * Q80_WIRE_BLOCK,
    };
    let mut payload = Vec::with_capacity(4 + body_len);
    payload.extend_from_slice(&op_id.to_le_bytes());
    match activation {
        Activation::F32(xs) => write_f32s(&mut payload, xs),
        Activation::Q80(blocks) => write_q80(&mut payload, blocks),
    }
    Frame::new(FrameTag::PlanStep, payload)
}

pub fn plan_result(op_id: u32, shard: &[f32]) -> Frame {
    let mut payload = Vec::with_capacity(4 + shard.len() * 4);
    payload.extend_from_slice(&op_id.to_le_bytes());
    write_f32s(&mut payload, shard);
    Frame::new(FrameTag::PlanResult, payload)
}

pub fn error_frame(code: ErrorCode) -> Frame {
    Frame::new(FrameTag::Error, code.to_u32().to_le_bytes().to_vec())
}

pub fn weights_frame(tensor_id: u32, shard: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(4 + shard.len());
    payload.extend_from_slice(&tensor_id.to_le_bytes());
    payload.extend_from_slice(shard);
    Frame::new(FrameTag::Weights, payload)
}

/// Split a leading `u32` id off a payload.
pub fn split_id(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        return Err(ProtocolError::PayloadLength { expected: 4, got: payload.len() });
    }
    Ok((LittleEndian::read_u32(&payload[..4]), &payload[4..]))
}

pub fn error_code(payload: &[u8]) -> Result<ErrorCode> {
    if payload.len() != 4 {
        return Err(ProtocolError::PayloadLength { expected: 4, got: payload.len() });
    }
    let raw = LittleEndian::read_u32(payload);
    ErrorCode::from_u32(raw)
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("unknown error code 0x{raw:08X}")))
}

pub fn write_f32s(buf: &mut Vec<u8>, xs: &[f32]) {
    let start = buf.len();
    buf.resize(start + xs.len() * 4, 0);
    LittleEndian::write_f32_into(xs, &mut buf[start..]);
}

pub fn read_f32s(bytes: &[u8], expected: usize) -> Result<Vec<f32>> {
    if bytes.len() != expected * 4 {
        return Err(ProtocolError::PayloadLength { expected: expected * 4, got: bytes.len() });
    }
    let mut out = vec![0.0f32; expected];
    LittleEndian::read_f32_into(bytes, &mut out);
    Ok(out)
}

/// Read F32 words into a preallocated buffer (the root's join path).
pub fn read_f32s_into(bytes: &[u8], out: &mut [f32]) -> Result<()> {
    if bytes.len() != out.len() * 4 {
        return Err(ProtocolError::PayloadLength { expected: out.len() * 4, got: bytes.len() });
    }
    LittleEndian::read_f32_into(bytes, out);
    Ok(())
}

pub fn write_q80(buf: &mut Vec<u8>, blocks: &[BlockQ80]) {
    buf.reserve(blocks.len() * Q80_WIRE_BLOCK);
    for block in blocks {
        buf.extend_from_slice(&block.d.to_bits().to_le_bytes());
        for &q in &block.qs {
            buf.push(q as u8);
        }
    }
}

pub fn read_q80(bytes: &[u8], expected_blocks: usize) -> Result<Vec<BlockQ80>> {
    if bytes.len() != expected_blocks * Q80_WIRE_BLOCK {
        return Err(ProtocolError::PayloadLength {
            expected: expected_blocks * Q80_WIRE_BLOCK,
            got: bytes.len(),
        });
    }
    let mut blocks = Vec::with_capacity(expected_blocks);
    for chunk in bytes.chunks_exact(Q80_WIRE_BLOCK) {
        let mut qs = [0i8; BLOCK_SIZE];
        for (q, &b) in qs.iter_mut().zip(&chunk[2..]) {
            *q = b as i8;
        }
        blocks.push(BlockQ80 {
            d: f16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])),
            qs,
        });
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_step_f32_roundtrip() {
        let xs = [1.0f32, -2.5, 3.25];
        let frame = plan_step(7, Activation::F32(&xs));
        assert_eq!(frame.tag, FrameTag::PlanStep);

        let (op_id, body) = split_id(&frame.payload).unwrap();
        assert_eq!(op_id, 7);
        assert_eq!(read_f32s(body, 3).unwrap(), xs);
    }

    #[test]
    fn plan_step_q80_roundtrip() {
        let mut block = BlockQ80::zeroed();
        block.d = f16::from_f32(0.5);
        block.qs[0] = -128;
        block.qs[31] = 127;

        let frame = plan_step(3, Activation::Q80(&[block]));
        let (op_id, body) = split_id(&frame.payload).unwrap();
        assert_eq!(op_id, 3);

        let blocks = read_q80(body, 1).unwrap();
        assert_eq!(blocks[0].d.to_bits(), block.d.to_bits());
        assert_eq!(blocks[0].qs, block.qs);
    }

    #[test]
    fn result_length_is_checked() {
        let frame = plan_result(0, &[1.0, 2.0]);
        let (_, body) = split_id(&frame.payload).unwrap();
        assert!(read_f32s(body, 3).is_err());
        assert!(read_f32s(body, 2).is_ok());
    }

    #[test]
    fn error_frame_roundtrip() {
        let frame = error_frame(ErrorCode::PositionMismatch);
        assert_eq!(error_code(&frame.payload).unwrap(), ErrorCode::PositionMismatch);
    }
}
