//! The execution plan: a flat, ordered list of tagged ops.
//!
//! The plan is built identically on the root and on every worker from the
//! shared spec; the wire `op_id` is simply the index into this list. `Local`
//! ops touch only root state; `Sharded` ops broadcast an activation and
//! concatenate the returned shards; `Reduce` ops sum the returned partials.

use meshlm_core::FloatType;
use meshlm_model::TransformerSpec;

/// Shard role of one op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    /// Root executes on its own state; no worker traffic.
    Local,
    /// Every slice computes an output shard; the root concatenates.
    Sharded,
    /// Every slice computes a partial vector; the root sums element-wise.
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// RMS-norm into `xb` ahead of attention.
    AttNorm,
    /// Q/K/V projections, sharded along heads.
    QkvProject,
    /// Rotary embedding over the gathered q/k.
    Rope,
    /// Root writes its kv-head shard of k/v into its cache.
    KvWrite,
    /// Causal attention, sharded along heads; each slice appends its kv
    /// shard from the broadcast before attending.
    AttHeads,
    /// Attention output projection, reduced across slices.
    AttOut,
    /// Residual add after attention.
    AttResidual,
    /// RMS-norm ahead of the FFN.
    FfnNorm,
    /// Dense SwiGLU gate/up, sharded along the intermediate dimension.
    FfnGateUp,
    /// Dense down projection, reduced.
    FfnDown,
    /// MoE gate/up for every active expert; routing is recomputed by each
    /// slice from the replicated router.
    MoeGateUp,
    /// MoE down projection, gate-weighted, reduced.
    MoeDown,
    /// Residual add after the FFN.
    FfnResidual,
    /// Final RMS-norm.
    FinalNorm,
    /// LM head, sharded over the vocabulary.
    LmHead,
}

/// One step of the plan. `input` is the element type the broadcast
/// activation travels in; replies are always F32.
#[derive(Debug, Clone, Copy)]
pub struct Op {
    pub kind: OpKind,
    pub role: ShardRole,
    pub layer: usize,
    pub input: FloatType,
}

impl Op {
    fn local(kind: OpKind, layer: usize) -> Self {
        Self { kind, role: ShardRole::Local, layer, input: FloatType::F32 }
    }

    fn sharded(kind: OpKind, layer: usize, input: FloatType) -> Self {
        Self { kind, role: ShardRole::Sharded, layer, input }
    }

    fn reduce(kind: OpKind, layer: usize, input: FloatType) -> Self {
        Self { kind, role: ShardRole::Reduce, layer, input }
    }

    /// Broadcast activation length in elements (zero for local ops).
    pub fn input_len(&self, spec: &TransformerSpec) -> usize {
        match self.kind {
            OpKind::QkvProject
            | OpKind::AttOut
            | OpKind::FfnGateUp
            | OpKind::MoeGateUp
            | OpKind::LmHead => spec.dim,
            OpKind::AttHeads => spec.dim + 2 * spec.kv_dim(),
            OpKind::FfnDown => spec.ffn_dim,
            OpKind::MoeDown => spec.n_active_experts * spec.ffn_dim,
            _ => 0,
        }
    }

    /// Per-slice reply length in elements (zero for local ops).
    pub fn result_len(&self, spec: &TransformerSpec) -> usize {
        match self.kind {
            OpKind::QkvProject => spec.dim_per_slice() + 2 * spec.kv_dim_per_slice(),
            OpKind::AttHeads => spec.dim_per_slice(),
            OpKind::AttOut | OpKind::FfnDown | OpKind::MoeDown => spec.dim,
            OpKind::FfnGateUp => spec.ffn_per_slice(),
            OpKind::MoeGateUp => spec.n_active_experts * spec.ffn_per_slice(),
            OpKind::LmHead => spec.vocab_per_slice(),
            _ => 0,
        }
    }
}

/// Build the plan for a spec. Per transformer block: norm, sharded QKV,
/// rotary, cache write, sharded attention, reduced output projection,
/// residual, norm, sharded gate/up, reduced down, residual; then the final
/// norm and the sharded LM head.
pub fn build_plan(spec: &TransformerSpec) -> Vec<Op> {
    let buf = spec.buffer_type;
    let mut plan = Vec::with_capacity(spec.n_layers * 11 + 2);

    for layer in 0..spec.n_layers {
        plan.push(Op::local(OpKind::AttNorm, layer));
        plan.push(Op::sharded(OpKind::QkvProject, layer, buf));
        plan.push(Op::local(OpKind::Rope, layer));
        plan.push(Op::local(OpKind::KvWrite, layer));
        // The attention broadcast carries roped q/k/v and feeds the slice
        // caches, so it stays F32.
        plan.push(Op::sharded(OpKind::AttHeads, layer, FloatType::F32));
        plan.push(Op::reduce(OpKind::AttOut, layer, buf));
        plan.push(Op::local(OpKind::AttResidual, layer));
        plan.push(Op::local(OpKind::FfnNorm, layer));
        if spec.arch.is_moe() {
            plan.push(Op::sharded(OpKind::MoeGateUp, layer, buf));
            plan.push(Op::reduce(OpKind::MoeDown, layer, buf));
        } else {
            plan.push(Op::sharded(OpKind::FfnGateUp, layer, buf));
            plan.push(Op::reduce(OpKind::FfnDown, layer, buf));
        }
        plan.push(Op::local(OpKind::FfnResidual, layer));
    }

    plan.push(Op::local(OpKind::FinalNorm, 0));
    plan.push(Op::sharded(OpKind::LmHead, 0, buf));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_model::Architecture;

    fn spec(arch: Architecture) -> TransformerSpec {
        let moe = arch.is_moe();
        TransformerSpec {
            arch,
            n_layers: 2,
            dim: 64,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 16,
            ffn_dim: 128,
            n_experts: if moe { 4 } else { 0 },
            n_active_experts: if moe { 2 } else { 0 },
            vocab_size: 128,
            max_seq_len: 32,
            weight_type: FloatType::F32,
            buffer_type: FloatType::F32,
            rope_theta: 10000.0,
            n_slices: 2,
        }
    }

    #[test]
    fn dense_block_order() {
        let plan = build_plan(&spec(Architecture::Llama2));
        assert_eq!(plan.len(), 2 * 11 + 2);

        let kinds: Vec<OpKind> = plan[..11].iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::AttNorm,
                OpKind::QkvProject,
                OpKind::Rope,
                OpKind::KvWrite,
                OpKind::AttHeads,
                OpKind::AttOut,
                OpKind::AttResidual,
                OpKind::FfnNorm,
                OpKind::FfnGateUp,
                OpKind::FfnDown,
                OpKind::FfnResidual,
            ]
        );
        assert_eq!(plan[plan.len() - 2].kind, OpKind::FinalNorm);
        assert_eq!(plan[plan.len() - 1].kind, OpKind::LmHead);
    }

    #[test]
    fn moe_blocks_swap_the_ffn_ops() {
        let plan = build_plan(&spec(Architecture::Mixtral));
        assert!(plan.iter().any(|op| op.kind == OpKind::MoeGateUp));
        assert!(plan.iter().any(|op| op.kind == OpKind::MoeDown));
        assert!(!plan.iter().any(|op| op.kind == OpKind::FfnGateUp));
    }

    #[test]
    fn roles_match_the_sharding_design() {
        let plan = build_plan(&spec(Architecture::Llama2));
        for op in &plan {
            let expected = match op.kind {
                OpKind::QkvProject | OpKind::AttHeads | OpKind::FfnGateUp | OpKind::LmHead => {
                    ShardRole::Sharded
                }
                OpKind::AttOut | OpKind::FfnDown => ShardRole::Reduce,
                _ => ShardRole::Local,
            };
            assert_eq!(op.role, expected, "{:?}", op.kind);
        }
    }

    #[test]
    fn wire_lengths() {
        let spec = spec(Architecture::Llama2);
        let plan = build_plan(&spec);

        let qkv = plan.iter().find(|op| op.kind == OpKind::QkvProject).unwrap();
        assert_eq!(qkv.input_len(&spec), 64);
        assert_eq!(qkv.result_len(&spec), 32 + 2 * 16);

        let att = plan.iter().find(|op| op.kind == OpKind::AttHeads).unwrap();
        assert_eq!(att.input_len(&spec), 64 + 2 * 32);
        assert_eq!(att.result_len(&spec), 32);

        let local = plan.iter().find(|op| op.kind == OpKind::Rope).unwrap();
        assert_eq!(local.input_len(&spec), 0);
        assert_eq!(local.result_len(&spec), 0);
    }
}
