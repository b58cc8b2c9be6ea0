//! F32 <-> Q8_0 / Q4_0 codecs and half-precision conversion.
//!
//! Every codec takes `(n_threads, thread_idx)` and quantizes its share of the
//! block range per the [`crate::pool::split_range`] contract, so the caller
//! can fan one call across the whole pool. Codecs never allocate; a length
//! that is not a whole number of blocks is a programming error.

use half::f16;
use once_cell::sync::Lazy;

use crate::pool::split_range;
use crate::tensor::{BlockQ40, BlockQ80, BLOCK_SIZE};

/// All 65,536 half values decoded once at startup. Indexed by the raw F16
/// bit pattern.
static F16_TO_F32: Lazy<Vec<f32>> =
    Lazy::new(|| (0..=u16::MAX).map(|bits| f16::from_bits(bits).to_f32()).collect());

#[inline(always)]
pub fn f16_to_f32(bits: u16) -> f32 {
    F16_TO_F32[bits as usize]
}

#[inline(always)]
pub fn f32_to_f16(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

pub fn quantize_q80(input: &[f32], output: &mut [BlockQ80], n_threads: usize, thread_idx: usize) {
    assert!(input.len() % BLOCK_SIZE == 0);
    let n_blocks = input.len() / BLOCK_SIZE;
    assert_eq!(output.len(), n_blocks);
    let (start, end) = split_range(n_blocks, n_threads, thread_idx);

    for i in start..end {
        let x = &input[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
        let block = &mut output[i];

        let mut amax = 0.0f32;
        for &v in x {
            amax = amax.max(v.abs());
        }

        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        block.d = f16::from_f32(d);
        for (q, &v) in block.qs.iter_mut().zip(x) {
            // |v * id| <= 127, so the rounded value always fits in i8.
            *q = (v * id).round() as i8;
        }
    }
}

pub fn dequantize_q80(input: &[BlockQ80], output: &mut [f32], n_threads: usize, thread_idx: usize) {
    assert!(output.len() % BLOCK_SIZE == 0);
    let n_blocks = output.len() / BLOCK_SIZE;
    assert_eq!(input.len(), n_blocks);
    let (start, end) = split_range(n_blocks, n_threads, thread_idx);

    for i in start..end {
        let block = &input[i];
        let d = f16_to_f32(block.d.to_bits());
        let y = &mut output[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
        for (o, &q) in y.iter_mut().zip(&block.qs) {
            *o = q as f32 * d;
        }
    }
}

pub fn quantize_q40(input: &[f32], output: &mut [BlockQ40], n_threads: usize, thread_idx: usize) {
    assert!(input.len() % BLOCK_SIZE == 0);
    let n_blocks = input.len() / BLOCK_SIZE;
    assert_eq!(output.len(), n_blocks);
    let half_size = BLOCK_SIZE / 2;
    let (start, end) = split_range(n_blocks, n_threads, thread_idx);

    for i in start..end {
        let x = &input[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];

        // Scale by the signed element of greatest magnitude so the full
        // [-8, 7] code range is usable.
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in x {
            if amax < v.abs() {
                amax = v.abs();
                max = v;
            }
        }

        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let block = &mut output[i];
        block.d = f16::from_f32(d);
        for j in 0..half_size {
            let x0 = x[j] * id;
            let x1 = x[half_size + j] * id;

            let c0 = ((x0 + 8.5) as i32).clamp(0, 15) as u8;
            let c1 = ((x1 + 8.5) as i32).clamp(0, 15) as u8;

            block.qs[j] = c0 | (c1 << 4);
        }
    }
}

pub fn dequantize_q40(input: &[BlockQ40], output: &mut [f32], n_threads: usize, thread_idx: usize) {
    assert!(output.len() % BLOCK_SIZE == 0);
    let n_blocks = output.len() / BLOCK_SIZE;
    assert_eq!(input.len(), n_blocks);
    let half_size = BLOCK_SIZE / 2;
    let (start, end) = split_range(n_blocks, n_threads, thread_idx);

    for i in start..end {
        let block = &input[i];
        let d = f16_to_f32(block.d.to_bits());

        for j in 0..half_size {
            let c0 = (block.qs[j] & 0x0F) as i32 - 8;
            let c1 = (block.qs[j] >> 4) as i32 - 8;

            output[i * BLOCK_SIZE + j] = c0 as f32 * d;
            output[i * BLOCK_SIZE + half_size + j] = c1 as f32 * d;
        }
    }
}
