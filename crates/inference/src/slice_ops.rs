//! Per-slice compute shared by the root and the workers.
//!
//! The root runs these for slice 0 and every worker for its own slice, so
//! both sides of a sharded op execute byte-identical arithmetic.

use meshlm_core::kernels::{attention, matvec, route_experts, silu_mul, ActVec, Mat};
use meshlm_core::quant::quantize_q80;
use meshlm_core::{split_range, BlockQ80, ShardedMut, ThreadPool, BLOCK_SIZE};
use meshlm_model::{ExpertSlice, LayerSlice, TransformerSpec};

/// Quantize an activation into wire blocks, fanned across the pool.
pub fn quantize_wire(pool: &ThreadPool, src: &[f32], dst: &mut [BlockQ80]) {
    debug_assert_eq!(src.len(), dst.len() * BLOCK_SIZE);
    let view = ShardedMut::new(dst);
    let n_blocks = src.len() / BLOCK_SIZE;
    pool.run(|n_threads, idx| {
        let (start, end) = split_range(n_blocks, n_threads, idx);
        if start < end {
            quantize_q80(
                &src[start * BLOCK_SIZE..end * BLOCK_SIZE],
                view.range(start, end),
                1,
                0,
            );
        }
    });
}

/// Narrow an activation to `[start, start + len)`. Quantized activations
/// move in whole blocks, so the bounds must be block-aligned.
pub fn act_block<'a>(act: &ActVec<'a>, start: usize, len: usize) -> ActVec<'a> {
    match act {
        ActVec::F32(xs) => ActVec::F32(&xs[start..start + len]),
        ActVec::Q80(blocks) => {
            debug_assert!(start % BLOCK_SIZE == 0 && len % BLOCK_SIZE == 0);
            ActVec::Q80(&blocks[start / BLOCK_SIZE..(start + len) / BLOCK_SIZE])
        }
    }
}

/// One matmul fanned across the pool.
pub fn matvec_pooled(pool: &ThreadPool, mat: &Mat, input: ActVec<'_>, out: &mut [f32]) {
    let view = ShardedMut::new(out);
    pool.run(|n_threads, idx| matvec(&view, mat, &input, n_threads, idx));
}

/// This slice's q/k/v projections.
pub fn qkv_project(
    pool: &ThreadPool,
    layer: &LayerSlice,
    input: ActVec<'_>,
    q: &mut [f32],
    k: &mut [f32],
    v: &mut [f32],
) {
    matvec_pooled(pool, &layer.wq, input, q);
    matvec_pooled(pool, &layer.wk, input, k);
    matvec_pooled(pool, &layer.wv, input, v);
}

/// Causal attention over this slice's heads and cached positions `0..=pos`.
#[allow(clippy::too_many_arguments)]
pub fn att_heads(
    spec: &TransformerSpec,
    pool: &ThreadPool,
    q_shard: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    pos: usize,
    scores: &mut [f32],
    out: &mut [f32],
) {
    let n_heads = spec.heads_per_slice();
    let n_kv_heads = spec.kv_heads_per_slice();
    let head_dim = spec.head_dim;
    let seq_cap = spec.max_seq_len;

    let out_view = ShardedMut::new(out);
    let score_view = ShardedMut::new(scores);
    pool.run(|n_threads, idx| {
        attention(
            &out_view,
            &score_view,
            q_shard,
            k_cache,
            v_cache,
            pos,
            n_heads,
            n_kv_heads,
            head_dim,
            seq_cap,
            n_threads,
            idx,
        )
    });
}

/// Dense SwiGLU gate/up for this slice: `out = silu(gate . in) * (up . in)`.
pub fn gate_up(
    pool: &ThreadPool,
    gate: &Mat,
    up: &Mat,
    input: ActVec<'_>,
    out: &mut [f32],
    up_scratch: &mut [f32],
) {
    matvec_pooled(pool, gate, input, out);
    matvec_pooled(pool, up, input, up_scratch);
    silu_mul(out, up_scratch);
}

/// Deterministic expert routing from the replicated router weights. Every
/// slice computes this from the identical broadcast activation.
pub fn moe_route(
    router: &Mat,
    x: &[f32],
    logits_scratch: &mut [f32],
    gates: &mut [(usize, f32)],
) {
    let view = ShardedMut::new(logits_scratch);
    matvec(&view, router, &ActVec::F32(x), 1, 0);
    route_experts(logits_scratch, gates);
}

/// Gate/up for every routed expert, written as `[expert][ffn/n_slices]`.
pub fn moe_gate_up(
    pool: &ThreadPool,
    experts: &[ExpertSlice],
    gates: &[(usize, f32)],
    input: ActVec<'_>,
    ffn_shard: usize,
    out: &mut [f32],
    up_scratch: &mut [f32],
) {
    debug_assert_eq!(out.len(), gates.len() * ffn_shard);
    for (j, &(e, _)) in gates.iter().enumerate() {
        let expert = &experts[e];
        let region = &mut out[j * ffn_shard..(j + 1) * ffn_shard];
        matvec_pooled(pool, &expert.gate, input, region);
        matvec_pooled(pool, &expert.up, input, up_scratch);
        silu_mul(region, up_scratch);
    }
}

/// Gate-weighted down projection partial for this slice's region of the
/// gathered MoE activations.
#[allow(clippy::too_many_arguments)]
pub fn moe_down_partial(
    pool: &ThreadPool,
    experts: &[ExpertSlice],
    gates: &[(usize, f32)],
    input: &ActVec<'_>,
    region_start: usize,
    ffn_shard: usize,
    out: &mut [f32],
    tmp: &mut [f32],
) {
    out.fill(0.0);
    for (j, &(e, gate)) in gates.iter().enumerate() {
        let block = act_block(input, region_start + j * ffn_shard, ffn_shard);
        matvec_pooled(pool, &experts[e].down, block, tmp);
        for (o, &t) in out.iter_mut().zip(tmp.iter()) {
            *o += gate * t;
        }
    }
}
