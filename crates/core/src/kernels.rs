//! CPU tensor kernels over quantized operands.
//!
//! The heavy kernels (matmul, attention) take `(n_threads, thread_idx)` and
//! partition output rows or heads by [`split_range`], so one dispatch through
//! the pool computes the whole output. Each output element is produced by
//! exactly one thread and its reduction order is fixed, which keeps results
//! bit-identical across thread counts. The cheap vector ops (norms, rotary,
//! residual) run on the dispatching thread.

use crate::pool::{split_range, ShardedMut};
use crate::quant::f16_to_f32;
use crate::tensor::{BlockQ40, BlockQ80, FloatType, BLOCK_SIZE};

/// Row-major weight matrix in one of the storable element types.
pub enum MatData {
    F32(Vec<f32>),
    F16(Vec<u16>),
    Q40(Vec<BlockQ40>),
    Q80(Vec<BlockQ80>),
}

pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: MatData,
}

impl Mat {
    /// Parse a raw little-endian tensor shard into its typed form.
    pub fn from_bytes(float_type: FloatType, rows: usize, cols: usize, bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), float_type.bytes_for(rows * cols), "shard size mismatch");
        let data = match float_type {
            FloatType::F32 => MatData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            FloatType::F16 => MatData::F16(
                bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
            ),
            FloatType::Q40 => {
                let block_bytes = std::mem::size_of::<BlockQ40>();
                MatData::Q40(
                    bytes
                        .chunks_exact(block_bytes)
                        .map(|c| {
                            let mut qs = [0u8; BLOCK_SIZE / 2];
                            qs.copy_from_slice(&c[2..]);
                            BlockQ40 {
                                d: half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])),
                                qs,
                            }
                        })
                        .collect(),
                )
            }
            FloatType::Q80 => {
                let block_bytes = std::mem::size_of::<BlockQ80>();
                MatData::Q80(
                    bytes
                        .chunks_exact(block_bytes)
                        .map(|c| {
                            let mut qs = [0i8; BLOCK_SIZE];
                            for (q, &b) in qs.iter_mut().zip(&c[2..]) {
                                *q = b as i8;
                            }
                            BlockQ80 {
                                d: half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])),
                                qs,
                            }
                        })
                        .collect(),
                )
            }
            FloatType::Unknown => panic!("cannot build a matrix of F_UNK"),
        };
        Self { rows, cols, data }
    }

    pub fn float_type(&self) -> FloatType {
        match self.data {
            MatData::F32(_) => FloatType::F32,
            MatData::F16(_) => FloatType::F16,
            MatData::Q40(_) => FloatType::Q40,
            MatData::Q80(_) => FloatType::Q80,
        }
    }
}

/// Activation operand of a matmul: plain F32 or a Q8_0 view of the same
/// vector (the form it travels in over the worker links).
#[derive(Clone, Copy)]
pub enum ActVec<'a> {
    F32(&'a [f32]),
    Q80(&'a [BlockQ80]),
}

impl ActVec<'_> {
    pub fn len(&self) -> usize {
        match self {
            ActVec::F32(x) => x.len(),
            ActVec::Q80(x) => x.len() * BLOCK_SIZE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `out[d] = sum_i w[d, i] * x[i]`, rows partitioned across threads.
pub fn matvec(out: &ShardedMut<f32>, mat: &Mat, x: &ActVec, n_threads: usize, thread_idx: usize) {
    assert_eq!(out.len(), mat.rows);
    assert_eq!(x.len(), mat.cols);

    let (start, end) = split_range(mat.rows, n_threads, thread_idx);
    let o = out.range(start, end);
    for d in start..end {
        o[d - start] = dot_row(mat, d, x);
    }
}

fn dot_row(mat: &Mat, row: usize, x: &ActVec) -> f32 {
    let cols = mat.cols;
    match (&mat.data, x) {
        (MatData::F32(w), ActVec::F32(x)) => {
            let w = &w[row * cols..(row + 1) * cols];
            let mut acc = 0.0f32;
            for (wi, xi) in w.iter().zip(*x) {
                acc += wi * xi;
            }
            acc
        }
        (MatData::F16(w), ActVec::F32(x)) => {
            let w = &w[row * cols..(row + 1) * cols];
            let mut acc = 0.0f32;
            for (wi, xi) in w.iter().zip(*x) {
                acc += f16_to_f32(*wi) * xi;
            }
            acc
        }
        (MatData::Q80(w), ActVec::F32(x)) => {
            let blocks_per_row = cols / BLOCK_SIZE;
            let w = &w[row * blocks_per_row..(row + 1) * blocks_per_row];
            let mut acc = 0.0f32;
            for (b, block) in w.iter().enumerate() {
                let d = f16_to_f32(block.d.to_bits());
                let xs = &x[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
                let mut sum = 0.0f32;
                for (q, xi) in block.qs.iter().zip(xs) {
                    sum += *q as f32 * xi;
                }
                acc += sum * d;
            }
            acc
        }
        (MatData::Q80(w), ActVec::Q80(x)) => {
            let blocks_per_row = cols / BLOCK_SIZE;
            let w = &w[row * blocks_per_row..(row + 1) * blocks_per_row];
            let mut acc = 0.0f32;
            for (wb, xb) in w.iter().zip(*x) {
                // Integer reduction per block, scaled by both block scales.
                let mut isum = 0i32;
                for (wq, xq) in wb.qs.iter().zip(&xb.qs) {
                    isum += *wq as i32 * *xq as i32;
                }
                acc += isum as f32 * f16_to_f32(wb.d.to_bits()) * f16_to_f32(xb.d.to_bits());
            }
            acc
        }
        (MatData::Q40(w), ActVec::F32(x)) => {
            let blocks_per_row = cols / BLOCK_SIZE;
            let w = &w[row * blocks_per_row..(row + 1) * blocks_per_row];
            let half_size = BLOCK_SIZE / 2;
            let mut acc = 0.0f32;
            for (b, block) in w.iter().enumerate() {
                let d = f16_to_f32(block.d.to_bits());
                let xs = &x[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
                let mut sum = 0.0f32;
                for j in 0..half_size {
                    let c0 = (block.qs[j] & 0x0F) as i32 - 8;
                    let c1 = (block.qs[j] >> 4) as i32 - 8;
                    sum += c0 as f32 * xs[j] + c1 as f32 * xs[half_size + j];
                }
                acc += sum * d;
            }
            acc
        }
        (MatData::Q40(w), ActVec::Q80(x)) => {
            let blocks_per_row = cols / BLOCK_SIZE;
            let w = &w[row * blocks_per_row..(row + 1) * blocks_per_row];
            let half_size = BLOCK_SIZE / 2;
            let mut acc = 0.0f32;
            for (wb, xb) in w.iter().zip(*x) {
                let mut isum = 0i32;
                for j in 0..half_size {
                    let c0 = (wb.qs[j] & 0x0F) as i32 - 8;
                    let c1 = (wb.qs[j] >> 4) as i32 - 8;
                    isum += c0 * xb.qs[j] as i32 + c1 * xb.qs[half_size + j] as i32;
                }
                acc += isum as f32 * f16_to_f32(wb.d.to_bits()) * f16_to_f32(xb.d.to_bits());
            }
            acc
        }
        _ => panic!(
            "unsupported matmul operands: {} weights with the given activation",
            mat.float_type()
        ),
    }
}

/// Decode one matrix row into F32 (embedding lookup).
pub fn dequantize_row(mat: &Mat, row: usize, out: &mut [f32]) {
    assert!(row < mat.rows);
    assert_eq!(out.len(), mat.cols);
    match &mat.data {
        MatData::F32(w) => out.copy_from_slice(&w[row * mat.cols..(row + 1) * mat.cols]),
        MatData::F16(w) => {
            for (o, &bits) in out.iter_mut().zip(&w[row * mat.cols..(row + 1) * mat.cols]) {
                *o = f16_to_f32(bits);
            }
        }
        MatData::Q80(w) => {
            let blocks = mat.cols / BLOCK_SIZE;
            crate::quant::dequantize_q80(&w[row * blocks..(row + 1) * blocks], out, 1, 0);
        }
        MatData::Q40(w) => {
            let blocks = mat.cols / BLOCK_SIZE;
            crate::quant::dequantize_q40(&w[row * blocks..(row + 1) * blocks], out, 1, 0);
        }
    }
}

/// `out = x * w / sqrt(mean(x^2) + eps)`.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(weight.len(), x.len());

    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    let inv = 1.0 / (ss / x.len() as f32 + eps).sqrt();
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * inv * w;
    }
}

/// In-place max-subtracted softmax.
pub fn softmax(xs: &mut [f32]) {
    if xs.is_empty() {
        return;
    }
    let max = xs.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0f32;
    for v in xs.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in xs.iter_mut() {
        *v /= sum;
    }
}

/// SwiGLU gate: `gate = silu(gate) * up`, element-wise, in place.
pub fn silu_mul(gate: &mut [f32], up: &[f32]) {
    debug_assert_eq!(gate.len(), up.len());
    for (g, &u) in gate.iter_mut().zip(up) {
        let silu = *g / (1.0 + (-*g).exp());
        *g = silu * u;
    }
}

/// `x += y`.
pub fn residual_add(x: &mut [f32], y: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    for (a, &b) in x.iter_mut().zip(y) {
        *a += b;
    }
}

/// Interleaved-pair rotary embedding over every head of `v` at position
/// `pos`. Frequencies depend only on the pair index within a head, so the
/// rotation commutes with sharding along heads.
pub fn rope(v: &mut [f32], pos: usize, head_dim: usize, theta: f32) {
    debug_assert!(v.len() % head_dim == 0);
    for i in (0..v.len()).step_by(2) {
        let pair = i % head_dim;
        let freq = 1.0 / theta.powf(pair as f32 / head_dim as f32);
        let angle = pos as f32 * freq;
        let (sin, cos) = angle.sin_cos();
        let x0 = v[i];
        let x1 = v[i + 1];
        v[i] = x0 * cos - x1 * sin;
        v[i + 1] = x0 * sin + x1 * cos;
    }
}

/// Causal multi-head attention over the cached positions `0..=pos` of one
/// layer. Heads are partitioned across threads; `scores` is a preallocated
/// `[n_heads * seq_cap]` scratch. Grouped-query: `kv_head = head / (n_heads /
/// n_kv_heads)`.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    out: &ShardedMut<f32>,
    scores: &ShardedMut<f32>,
    q: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    pos: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    seq_cap: usize,
    n_threads: usize,
    thread_idx: usize,
) {
    debug_assert_eq!(q.len(), n_heads * head_dim);
    debug_assert_eq!(out.len(), n_heads * head_dim);
    debug_assert!(pos < seq_cap);

    let kv_dim = n_kv_heads * head_dim;
    let group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let (head_start, head_end) = split_range(n_heads, n_threads, thread_idx);
    for h in head_start..head_end {
        let kv_h = h / group;
        let q_h = &q[h * head_dim..(h + 1) * head_dim];
        let att = scores.range(h * seq_cap, h * seq_cap + pos + 1);

        for (t, a) in att.iter_mut().enumerate() {
            let k_t = &k_cache[t * kv_dim + kv_h * head_dim..][..head_dim];
            let mut dot = 0.0f32;
            for (qi, ki) in q_h.iter().zip(k_t) {
                dot += qi * ki;
            }
            *a = dot * scale;
        }

        softmax(att);

        let out_h = out.range(h * head_dim, (h + 1) * head_dim);
        out_h.fill(0.0);
        for (t, &a) in att.iter().enumerate() {
            let v_t = &v_cache[t * kv_dim + kv_h * head_dim..][..head_dim];
            for (o, vi) in out_h.iter_mut().zip(v_t) {
                *o += a * vi;
            }
        }
    }
}

/// Top-k expert selection: softmax over the router logits, pick the `k`
/// largest, renormalize the selected gates. `selected.len()` is `k`.
pub fn route_experts(router_logits: &mut [f32], selected: &mut [(usize, f32)]) {
    debug_assert!(selected.len() <= router_logits.len());
    debug_assert!(router_logits.len() <= 64);
    softmax(router_logits);

    let mut taken = 0u64;
    for slot in selected.iter_mut() {
        let mut best = usize::MAX;
        let mut best_p = f32::NEG_INFINITY;
        for (e, &p) in router_logits.iter().enumerate() {
            if taken & (1 << e) == 0 && p > best_p {
                best = e;
                best_p = p;
            }
        }
        taken |= 1 << best;
        *slot = (best, best_p);
    }

    let total: f32 = selected.iter().map(|&(_, g)| g).sum();
    for (_, g) in selected.iter_mut() {
        *g /= total;
    }
}
