//! Per-request activation state.
//!
//! Every buffer is allocated once at driver construction and reused; a token
//! step never allocates. The KV cache holds only this slice's kv-head shard
//! per layer and position.

use meshlm_core::{BlockQ80, BLOCK_SIZE};
use meshlm_model::TransformerSpec;

pub struct InferenceState {
    /// Residual stream.
    pub x: Vec<f32>,
    /// Normed input / gathered attention output.
    pub xb: Vec<f32>,
    /// Reduce target (attention output projection, FFN down).
    pub xb2: Vec<f32>,
    /// Gathered gate-up activations: `[ffn]` dense, `[n_active * ffn]` MoE
    /// in `[slice][expert][ffn/n_slices]` order.
    pub hb: Vec<f32>,
    /// Per-slice up-projection scratch.
    pub hb2: Vec<f32>,
    /// Gathered query / key / value for the current position.
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub logits: Vec<f32>,

    /// This slice's KV cache: `[n_layers][max_seq][kv_shard]`.
    pub k_cache: Vec<f32>,
    pub v_cache: Vec<f32>,
    /// Cache length per layer; all equal at token boundaries.
    pub cache_len: Vec<usize>,

    /// Attention score scratch, `[heads_per_slice * max_seq]`.
    pub scores: Vec<f32>,
    /// Contiguous `q||k||v` staging for the attention broadcast.
    pub qkv_buf: Vec<f32>,
    /// Incoming partial for reduce joins.
    pub reduce_buf: Vec<f32>,
    /// Q8_0 staging for quantized broadcasts.
    pub wire_q80: Vec<BlockQ80>,

    /// Router logits scratch and the routing picked for the current layer.
    pub moe_logits: Vec<f32>,
    pub moe_gates: Vec<(usize, f32)>,
    /// Dequantized router input when the broadcast is Q8_0.
    pub moe_in: Vec<f32>,
}

impl InferenceState {
    pub fn new(spec: &TransformerSpec) -> Self {
        let kv_dim = spec.kv_dim();
        let kv_shard = spec.kv_dim_per_slice();
        let hb_len = if spec.arch.is_moe() {
            spec.n_active_experts * spec.ffn_dim
        } else {
            spec.ffn_dim
        };
        let max_wire = spec
            .dim
            .max(spec.ffn_dim)
            .max(hb_len)
            .max(spec.dim + 2 * kv_dim);

        Self {
            x: vec![0.0; spec.dim],
            xb: vec![0.0; spec.dim],
            xb2: vec![0.0; spec.dim],
            hb: vec![0.0; hb_len],
            hb2: vec![0.0; spec.ffn_per_slice()],
            q: vec![0.0; spec.dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            logits: vec![0.0; spec.vocab_size],
            k_cache: vec![0.0; spec.n_layers * spec.max_seq_len * kv_shard],
            v_cache: vec![0.0; spec.n_layers * spec.max_seq_len * kv_shard],
            cache_len: vec![0; spec.n_layers],
            scores: vec![0.0; spec.heads_per_slice() * spec.max_seq_len],
            qkv_buf: vec![0.0; spec.dim + 2 * kv_dim],
            reduce_buf: vec![0.0; spec.dim],
            wire_q80: vec![BlockQ80::zeroed(); max_wire.div_ceil(BLOCK_SIZE)],
            moe_logits: vec![0.0; spec.n_experts],
            moe_gates: vec![(0, 0.0); spec.n_active_experts],
            moe_in: vec![0.0; spec.dim],
        }
    }

    /// Zero the per-request state; weights are untouched.
    pub fn reset(&mut self) {
        for buf in [
            &mut self.x,
            &mut self.xb,
            &mut self.xb2,
            &mut self.hb,
            &mut self.hb2,
            &mut self.q,
            &mut self.k,
            &mut self.v,
            &mut self.logits,
        ] {
            buf.fill(0.0);
        }
        self.cache_len.fill(0);
    }

    /// One layer's K cache rows, `[max_seq][kv_shard]`.
    pub fn k_cache_layer(&self, spec: &TransformerSpec, layer: usize) -> &[f32] {
        let stride = spec.max_seq_len * spec.kv_dim_per_slice();
        &self.k_cache[layer * stride..(layer + 1) * stride]
    }

    pub fn v_cache_layer(&self, spec: &TransformerSpec, layer: usize) -> &[f32] {
        let stride = spec.max_seq_len * spec.kv_dim_per_slice();
        &self.v_cache[layer * stride..(layer + 1) * stride]
    }

    /// Write this slice's k/v shard at `pos` of `layer`.
    pub fn kv_write(&mut self, spec: &TransformerSpec, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        let kv_shard = spec.kv_dim_per_slice();
        debug_assert_eq!(k.len(), kv_shard);
        debug_assert_eq!(v.len(), kv_shard);
        let offset = (layer * spec.max_seq_len + pos) * kv_shard;
        self.k_cache[offset..offset + kv_shard].copy_from_slice(k);
        self.v_cache[offset..offset + kv_shard].copy_from_slice(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::FloatType;
    use meshlm_model::Architecture;

    fn spec() -> TransformerSpec {
        TransformerSpec {
            arch: Architecture::Llama2,
            n_layers: 2,
            dim: 16,
            n_heads: 2,
            n_kv_heads: 2,
            head_dim: 8,
            ffn_dim: 32,
            n_experts: 0,
            n_active_experts: 0,
            vocab_size: 32,
            max_seq_len: 4,
            weight_type: FloatType::F32,
            buffer_type: FloatType::F32,
            rope_theta: 10000.0,
            n_slices: 2,
        }
    }

    #[test]
    fn kv_write_lands_in_the_right_row() {
        let spec = spec();
        let mut state = InferenceState::new(&spec);
        let kv_shard = spec.kv_dim_per_slice();

        let k = vec![1.0; kv_shard];
        let v = vec![2.0; kv_shard];
        state.kv_write(&spec, 1, 2, &k, &v);

        let layer = state.k_cache_layer(&spec, 1);
        assert!(layer[2 * kv_shard..3 * kv_shard].iter().all(|&x| x == 1.0));
        assert!(layer[..2 * kv_shard].iter().all(|&x| x == 0.0));
        assert!(state.k_cache_layer(&spec, 0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn reset_clears_request_state() {
        let spec = spec();
        let mut state = InferenceState::new(&spec);
        state.x[0] = 5.0;
        state.cache_len[1] = 3;
        state.reset();
        assert_eq!(state.x[0], 0.0);
        assert_eq!(state.cache_len, vec![0, 0]);
    }
}
