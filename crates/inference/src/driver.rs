//! The root inference driver.
//!
//! `infer` runs the plan for one token position: local ops execute on the
//! root's thread pool, sharded and reduce ops broadcast a `PlanStep` to every
//! worker, compute the root's own shard, then join the replies in worker
//! order. Concatenation and reduction both happen here; workers never see
//! each other.

use meshlm_core::kernels::{dequantize_row, residual_add, rmsnorm, rope, ActVec};
use meshlm_core::quant::dequantize_q80;
use meshlm_core::{ThreadPool, BLOCK_SIZE};
use meshlm_model::{
    shard_bytes, FfnSlice, ModelError, SliceWeights, TensorId, TransformerSpec,
};
use meshlm_protocol::payload::{self, Activation};
use meshlm_protocol::{ErrorCode, Frame, FrameTag, LinkPool};

use crate::error::{InferenceError, Result};
use crate::generate::Infer;
use crate::plan::{build_plan, Op, OpKind, ShardRole};
use crate::slice_ops;
use crate::state::InferenceState;

/// Push the spec and every weight shard to the connected workers, in
/// canonical tensor order. `full_tensor` yields the unsliced bytes (the
/// server reads them from the mapped weight file).
pub fn push_slices<F>(links: &mut LinkPool, spec: &TransformerSpec, mut full_tensor: F) -> Result<()>
where
    F: FnMut(TensorId) -> Result<Vec<u8>>,
{
    for w in 0..links.len() {
        let slice_idx = w + 1;
        links
            .link(w)
            .send(&Frame::new(FrameTag::Spec, spec.to_wire(slice_idx)))?;
        for id in TensorId::enumerate(spec, slice_idx) {
            let layout = id.layout(spec);
            let full = full_tensor(id)?;
            let shard = shard_bytes(&full, &layout, spec.n_slices, slice_idx);
            links.link(w).send(&payload::weights_frame(id.encode(), &shard))?;
        }
        tracing::info!(worker = slice_idx, "pushed weight slice");
    }
    Ok(())
}

pub struct Driver {
    spec: TransformerSpec,
    weights: SliceWeights,
    plan: Vec<Op>,
    links: LinkPool,
    pool: ThreadPool,
    state: InferenceState,
}

impl Driver {
    pub fn new(
        spec: TransformerSpec,
        weights: SliceWeights,
        links: LinkPool,
        n_threads: usize,
    ) -> Result<Self> {
        spec.validate()?;
        if links.len() + 1 != spec.n_slices {
            return Err(ModelError::Validation(format!(
                "{} worker links for {} slices",
                links.len(),
                spec.n_slices
            ))
            .into());
        }
        let plan = build_plan(&spec);
        let state = InferenceState::new(&spec);
        Ok(Self {
            spec,
            weights,
            plan,
            links,
            pool: ThreadPool::new(n_threads),
            state,
        })
    }

    pub fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    /// One token step: embedding lookup, plan walk, logits.
    pub fn infer(&mut self, token: u32, pos: u32) -> Result<&[f32]> {
        let pos = pos as usize;
        assert!(pos < self.spec.max_seq_len, "position {pos} beyond the sequence limit");
        assert!((token as usize) < self.spec.vocab_size, "token {token} outside the vocabulary");
        if pos != self.state.cache_len[0] {
            return Err(InferenceError::PositionMismatch {
                expected: self.state.cache_len[0],
                got: pos,
            });
        }

        let embedding = self
            .weights
            .token_embedding
            .as_ref()
            .expect("root slice holds the embedding table");
        dequantize_row(embedding, token as usize, &mut self.state.x);

        for op_idx in 0..self.plan.len() {
            let op = self.plan[op_idx];
            match op.role {
                ShardRole::Local => self.run_local(op, pos),
                ShardRole::Sharded | ShardRole::Reduce => {
                    self.run_distributed(op_idx as u32, op, pos)?
                }
            }
        }
        Ok(&self.state.logits)
    }

    /// Zero the per-request state here and on every worker.
    pub fn reset(&mut self) -> Result<()> {
        self.state.reset();
        self.links.broadcast(&Frame::bare(FrameTag::Reset))?;
        Ok(())
    }

    /// Abort path: tell every worker the request died, clear local state.
    /// Send failures are swallowed; the links may already be gone.
    pub fn abort(&mut self) {
        self.state.reset();
        self.links.broadcast_lossy(&payload::error_frame(ErrorCode::Internal));
    }

    fn run_local(&mut self, op: Op, pos: usize) {
        let spec = &self.spec;
        let st = &mut self.state;
        let eps = spec.norm_eps();

        match op.kind {
            OpKind::AttNorm => {
                let layer = &self.weights.layers[op.layer];
                rmsnorm(&mut st.xb, &st.x, &layer.att_norm, eps);
            }
            OpKind::Rope => {
                rope(&mut st.q, pos, spec.head_dim, spec.rope_theta);
                rope(&mut st.k, pos, spec.head_dim, spec.rope_theta);
            }
            OpKind::KvWrite => {
                let kv_shard = spec.kv_dim_per_slice();
                let offset = (op.layer * spec.max_seq_len + pos) * kv_shard;
                st.k_cache[offset..offset + kv_shard].copy_from_slice(&st.k[..kv_shard]);
                st.v_cache[offset..offset + kv_shard].copy_from_slice(&st.v[..kv_shard]);
                st.cache_len[op.layer] = pos + 1;
            }
            OpKind::AttResidual | OpKind::FfnResidual => {
                residual_add(&mut st.x, &st.xb2);
            }
            OpKind::FfnNorm => {
                let layer = &self.weights.layers[op.layer];
                rmsnorm(&mut st.xb, &st.x, &layer.ffn_norm, eps);
            }
            OpKind::FinalNorm => {
                let norm = self.weights.final_norm.as_ref().expect("root holds the final norm");
                // The residual stream normalizes onto itself ahead of the
                // LM head; xb carries the result.
                rmsnorm(&mut st.xb, &st.x, norm, eps);
            }
            _ => unreachable!("{:?} is not a local op", op.kind),
        }
    }

    fn run_distributed(&mut self, op_id: u32, op: Op, pos: usize) -> Result<()> {
        self.broadcast_step(op_id, op)?;
        self.compute_own_shard(op, pos);
        self.join_results(op_id, op)
    }

    /// Stage the op's input activation and send it to every worker.
    fn broadcast_step(&mut self, op_id: u32, op: Op) -> Result<()> {
        let spec = &self.spec;
        let st = &mut self.state;

        if op.kind == OpKind::AttHeads {
            let dim = spec.dim;
            let kv_dim = spec.kv_dim();
            st.qkv_buf[..dim].copy_from_slice(&st.q);
            st.qkv_buf[dim..dim + kv_dim].copy_from_slice(&st.k);
            st.qkv_buf[dim + kv_dim..].copy_from_slice(&st.v);
        }

        // Quantize even without workers: the root's own compute consumes the
        // same wire representation, so one- and many-slice runs agree.
        let input_len = op.input_len(spec);
        let quantized = op.input == meshlm_core::FloatType::Q80;
        if quantized {
            let n_blocks = input_len / BLOCK_SIZE;
            let src = match op.kind {
                OpKind::FfnDown | OpKind::MoeDown => &st.hb[..input_len],
                OpKind::AttHeads => &st.qkv_buf[..input_len],
                _ => &st.xb[..input_len],
            };
            slice_ops::quantize_wire(&self.pool, src, &mut st.wire_q80[..n_blocks]);
        }

        if !self.links.is_empty() {
            let activation = self.op_activation(op);
            let frame = payload::plan_step(op_id, activation);
            self.links.broadcast(&frame)?;
        }
        Ok(())
    }

    /// The activation view the broadcast and the root's own compute share.
    fn op_activation(&self, op: Op) -> Activation<'_> {
        let spec = &self.spec;
        let st = &self.state;
        let input_len = op.input_len(spec);
        if op.input == meshlm_core::FloatType::Q80 {
            Activation::Q80(&st.wire_q80[..input_len / BLOCK_SIZE])
        } else {
            let src = match op.kind {
                OpKind::FfnDown | OpKind::MoeDown => &st.hb[..input_len],
                OpKind::AttHeads => &st.qkv_buf[..input_len],
                _ => &st.xb[..input_len],
            };
            Activation::F32(src)
        }
    }

    fn compute_own_shard(&mut self, op: Op, pos: usize) {
        let spec = &self.spec;
        let pool = &self.pool;
        let st = &mut self.state;
        let dps = spec.dim_per_slice();
        let kvps = spec.kv_dim_per_slice();
        let fps = spec.ffn_per_slice();

        let input_len = op.input_len(spec);
        let quantized = op.input == meshlm_core::FloatType::Q80;
        macro_rules! act {
            ($src:expr) => {
                if quantized {
                    ActVec::Q80(&st.wire_q80[..input_len / BLOCK_SIZE])
                } else {
                    ActVec::F32($src)
                }
            };
        }

        match op.kind {
            OpKind::QkvProject => {
                let layer = &self.weights.layers[op.layer];
                let input = act!(&st.xb[..input_len]);
                slice_ops::qkv_project(
                    pool,
                    layer,
                    input,
                    &mut st.q[..dps],
                    &mut st.k[..kvps],
                    &mut st.v[..kvps],
                );
            }
            OpKind::AttHeads => {
                // The root's cache row for `pos` was written by KvWrite.
                let stride = spec.max_seq_len * kvps;
                let k_cache = &st.k_cache[op.layer * stride..(op.layer + 1) * stride];
                let v_cache = &st.v_cache[op.layer * stride..(op.layer + 1) * stride];
                slice_ops::att_heads(
                    spec,
                    pool,
                    &st.qkv_buf[..dps],
                    k_cache,
                    v_cache,
                    pos,
                    &mut st.scores,
                    &mut st.xb[..dps],
                );
            }
            OpKind::AttOut => {
                let layer = &self.weights.layers[op.layer];
                let input = act!(&st.xb[..input_len]);
                let block = slice_ops::act_block(&input, 0, dps);
                slice_ops::matvec_pooled(pool, &layer.wo, block, &mut st.xb2);
            }
            OpKind::FfnGateUp => {
                let FfnSlice::Dense { gate, up, .. } = &self.weights.layers[op.layer].ffn else {
                    unreachable!("dense op on an MoE layer");
                };
                let input = act!(&st.xb[..input_len]);
                slice_ops::gate_up(pool, gate, up, input, &mut st.hb[..fps], &mut st.hb2);
            }
            OpKind::FfnDown => {
                let FfnSlice::Dense { down, .. } = &self.weights.layers[op.layer].ffn else {
                    unreachable!("dense op on an MoE layer");
                };
                let input = act!(&st.hb[..input_len]);
                let block = slice_ops::act_block(&input, 0, fps);
                slice_ops::matvec_pooled(pool, down, block, &mut st.xb2);
            }
            OpKind::MoeGateUp => {
                let FfnSlice::Moe { router, experts } = &self.weights.layers[op.layer].ffn else {
                    unreachable!("MoE op on a dense layer");
                };
                // Route from the broadcast representation so every slice
                // picks identical experts.
                if quantized {
                    dequantize_q80(&st.wire_q80[..input_len / BLOCK_SIZE], &mut st.moe_in, 1, 0);
                } else {
                    st.moe_in.copy_from_slice(&st.xb);
                }
                slice_ops::moe_route(router, &st.moe_in, &mut st.moe_logits, &mut st.moe_gates);

                let input = act!(&st.xb[..input_len]);
                let own = spec.n_active_experts * fps;
                slice_ops::moe_gate_up(
                    pool,
                    experts,
                    &st.moe_gates,
                    input,
                    fps,
                    &mut st.hb[..own],
                    &mut st.hb2,
                );
            }
            OpKind::MoeDown => {
                let FfnSlice::Moe { experts, .. } = &self.weights.layers[op.layer].ffn else {
                    unreachable!("MoE op on a dense layer");
                };
                let input = act!(&st.hb[..input_len]);
                let (xb2, tmp) = (&mut st.xb2, &mut st.reduce_buf);
                slice_ops::moe_down_partial(pool, experts, &st.moe_gates, &input, 0, fps, xb2, tmp);
            }
            OpKind::LmHead => {
                let input = act!(&st.xb[..input_len]);
                let vps = spec.vocab_per_slice();
                slice_ops::matvec_pooled(pool, &self.weights.lm_head, input, &mut st.logits[..vps]);
            }
            _ => unreachable!("{:?} is not a distributed op", op.kind),
        }
    }

    /// Collect every worker's reply in worker order and fold it in.
    fn join_results(&mut self, op_id: u32, op: Op) -> Result<()> {
        let expected_bytes = op.result_len(&self.spec) * 4;
        for w in 0..self.links.len() {
            let frame = self.links.link(w).recv_expect(FrameTag::PlanResult)?;
            let (got_id, body) = payload::split_id(&frame.payload)?;
            if got_id != op_id {
                return Err(InferenceError::OpMismatch { expected: op_id, got: got_id });
            }
            if body.len() != expected_bytes {
                return Err(meshlm_protocol::ProtocolError::PayloadLength {
                    expected: expected_bytes,
                    got: body.len(),
                }
                .into());
            }

            let spec = &self.spec;
            let st = &mut self.state;
            let slice = w + 1;
            match op.role {
                ShardRole::Sharded => match op.kind {
                    OpKind::QkvProject => {
                        let dps = spec.dim_per_slice();
                        let kvps = spec.kv_dim_per_slice();
                        let (qb, rest) = body.split_at(dps * 4);
                        let (kb, vb) = rest.split_at(kvps * 4);
                        payload::read_f32s_into(qb, &mut st.q[slice * dps..(slice + 1) * dps])?;
                        payload::read_f32s_into(kb, &mut st.k[slice * kvps..(slice + 1) * kvps])?;
                        payload::read_f32s_into(vb, &mut st.v[slice * kvps..(slice + 1) * kvps])?;
                    }
                    OpKind::AttHeads => {
                        let dps = spec.dim_per_slice();
                        payload::read_f32s_into(body, &mut st.xb[slice * dps..(slice + 1) * dps])?;
                    }
                    OpKind::FfnGateUp => {
                        let fps = spec.ffn_per_slice();
                        payload::read_f32s_into(body, &mut st.hb[slice * fps..(slice + 1) * fps])?;
                    }
                    OpKind::MoeGateUp => {
                        let region = spec.n_active_experts * spec.ffn_per_slice();
                        payload::read_f32s_into(
                            body,
                            &mut st.hb[slice * region..(slice + 1) * region],
                        )?;
                    }
                    OpKind::LmHead => {
                        let vps = spec.vocab_per_slice();
                        payload::read_f32s_into(
                            body,
                            &mut st.logits[slice * vps..(slice + 1) * vps],
                        )?;
                    }
                    _ => unreachable!(),
                },
                ShardRole::Reduce => {
                    payload::read_f32s_into(body, &mut st.reduce_buf)?;
                    residual_add(&mut st.xb2, &st.reduce_buf);
                }
                ShardRole::Local => unreachable!(),
            }
        }
        Ok(())
    }
}

impl Infer for Driver {
    fn infer(&mut self, token: u32, pos: u32) -> Result<&[f32]> {
        Driver::infer(self, token, pos)
    }
}
