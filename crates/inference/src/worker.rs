//! Worker-side executor.
//!
//! A worker owns one slice of every layer's weights, its kv-head shard of
//! the cache, and a thread pool. It answers the root's `PlanStep`s in strict
//! FIFO order: parse the broadcast activation, run the sliced kernel for its
//! slice, reply with the F32 shard.

use std::io::ErrorKind;

use meshlm_core::kernels::ActVec;
use meshlm_core::quant::dequantize_q80;
use meshlm_core::{BlockQ80, FloatType, ThreadPool, BLOCK_SIZE};
use meshlm_model::{FfnSlice, ModelError, SliceWeights, TransformerSpec};
use meshlm_protocol::payload;
use meshlm_protocol::{ErrorCode, FrameTag, ProtocolError, WorkerLink};

use crate::error::{InferenceError, Result};
use crate::plan::{build_plan, Op, OpKind, ShardRole};
use crate::slice_ops;

enum OwnedAct {
    F32(Vec<f32>),
    Q80(Vec<BlockQ80>),
}

impl OwnedAct {
    fn view(&self) -> ActVec<'_> {
        match self {
            OwnedAct::F32(xs) => ActVec::F32(xs),
            OwnedAct::Q80(blocks) => ActVec::Q80(blocks),
        }
    }
}

struct WorkerState {
    k_cache: Vec<f32>,
    v_cache: Vec<f32>,
    cache_len: Vec<usize>,
    out: Vec<f32>,
    up_scratch: Vec<f32>,
    scores: Vec<f32>,
    tmp: Vec<f32>,
    moe_in: Vec<f32>,
    moe_logits: Vec<f32>,
    moe_gates: Vec<(usize, f32)>,
}

impl WorkerState {
    fn new(spec: &TransformerSpec) -> Self {
        let kv_shard = spec.kv_dim_per_slice();
        let max_out = (spec.dim_per_slice() + 2 * kv_shard)
            .max(spec.dim)
            .max(spec.ffn_per_slice().max(1) * spec.n_active_experts.max(1))
            .max(spec.ffn_per_slice())
            .max(spec.vocab_per_slice());
        Self {
            k_cache: vec![0.0; spec.n_layers * spec.max_seq_len * kv_shard],
            v_cache: vec![0.0; spec.n_layers * spec.max_seq_len * kv_shard],
            cache_len: vec![0; spec.n_layers],
            out: vec![0.0; max_out],
            up_scratch: vec![0.0; spec.ffn_per_slice()],
            scores: vec![0.0; spec.heads_per_slice() * spec.max_seq_len],
            tmp: vec![0.0; spec.dim],
            moe_in: vec![0.0; spec.dim],
            moe_logits: vec![0.0; spec.n_experts],
            moe_gates: vec![(0, 0.0); spec.n_active_experts],
        }
    }

    fn clear(&mut self) {
        self.cache_len.fill(0);
    }
}

pub struct WorkerExecutor {
    link: WorkerLink,
    spec: TransformerSpec,
    slice_idx: usize,
    weights: SliceWeights,
    plan: Vec<Op>,
    pool: ThreadPool,
    state: WorkerState,
}

impl WorkerExecutor {
    /// Run the startup handshake on a fresh root link: receive the spec and
    /// then every weight shard in canonical order.
    pub fn handshake(mut link: WorkerLink, n_threads: usize) -> Result<Self> {
        let frame = link.recv_expect(FrameTag::Spec)?;
        let (spec, slice_idx) = TransformerSpec::from_wire(&frame.payload)?;
        if slice_idx == 0 {
            return Err(ModelError::Validation("a worker cannot serve slice 0".into()).into());
        }
        tracing::info!(
            arch = %spec.arch,
            slice = slice_idx,
            n_slices = spec.n_slices,
            "handshake: receiving weight slice"
        );

        let weights = SliceWeights::from_source::<InferenceError, _>(&spec, slice_idx, |id, _| {
            let frame = link.recv_expect(FrameTag::Weights)?;
            let (tensor_id, body) = payload::split_id(&frame.payload)?;
            if tensor_id != id.encode() {
                return Err(ProtocolError::MalformedPayload(format!(
                    "expected tensor {}, got id 0x{tensor_id:08X}",
                    id.name()
                ))
                .into());
            }
            Ok(body.to_vec())
        })?;

        let plan = build_plan(&spec);
        let state = WorkerState::new(&spec);
        tracing::info!(slice = slice_idx, "weight slice loaded, serving");
        Ok(Self {
            link,
            spec,
            slice_idx,
            weights,
            plan,
            pool: ThreadPool::new(n_threads),
            state,
        })
    }

    /// Serve plan steps until the root disconnects. An invariant violation
    /// reports an `Error` frame and returns the failure.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            let frame = match self.link.recv() {
                Ok(frame) => frame,
                Err(ProtocolError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    tracing::info!("root link closed");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            match frame.tag {
                FrameTag::PlanStep => {
                    if let Err(err) = self.handle_step(&frame.payload) {
                        let code = error_code_for(&err);
                        let _ = self.link.send(&payload::error_frame(code));
                        return Err(err);
                    }
                }
                FrameTag::Reset => {
                    self.state.clear();
                }
                FrameTag::Error => {
                    let code = payload::error_code(&frame.payload)?;
                    tracing::warn!(?code, "root aborted the request");
                    self.state.clear();
                }
                other => {
                    let _ = self.link.send(&payload::error_frame(ErrorCode::UnexpectedTag));
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: FrameTag::PlanStep,
                        got: other,
                    }
                    .into());
                }
            }
        }
    }

    fn handle_step(&mut self, frame_payload: &[u8]) -> Result<()> {
        let (op_id, body) = payload::split_id(frame_payload)?;
        let op = *self
            .plan
            .get(op_id as usize)
            .filter(|op| op.role != ShardRole::Local)
            .ok_or(InferenceError::UnknownOp(op_id))?;

        let input_len = op.input_len(&self.spec);
        let act = if op.input == FloatType::Q80 {
            OwnedAct::Q80(payload::read_q80(body, input_len / BLOCK_SIZE)?)
        } else {
            OwnedAct::F32(payload::read_f32s(body, input_len)?)
        };

        let result_len = op.result_len(&self.spec);
        self.execute(op, &act)?;
        let reply = payload::plan_result(op_id, &self.state.out[..result_len]);
        self.link.send(&reply)?;
        Ok(())
    }

    fn execute(&mut self, op: Op, act: &OwnedAct) -> Result<()> {
        let spec = &self.spec;
        let pool = &self.pool;
        let st = &mut self.state;
        let s = self.slice_idx;
        let dps = spec.dim_per_slice();
        let kvps = spec.kv_dim_per_slice();
        let fps = spec.ffn_per_slice();
        let input = act.view();
        let layer = &self.weights.layers[op.layer];

        match op.kind {
            OpKind::QkvProject => {
                let (q, rest) = st.out[..dps + 2 * kvps].split_at_mut(dps);
                let (k, v) = rest.split_at_mut(kvps);
                slice_ops::qkv_project(pool, layer, input, q, k, v);
            }
            OpKind::AttHeads => {
                let ActVec::F32(full) = input else {
                    return Err(ProtocolError::MalformedPayload(
                        "attention broadcast must be F32".into(),
                    )
                    .into());
                };
                let pos = st.cache_len[op.layer];
                if pos >= spec.max_seq_len {
                    return Err(InferenceError::PositionMismatch {
                        expected: spec.max_seq_len - 1,
                        got: pos,
                    });
                }
                // Layers fill in order within a token; a skipped or repeated
                // step shows up as a per-layer length mismatch.
                if op.layer > 0 && st.cache_len[op.layer - 1] != pos + 1 {
                    return Err(InferenceError::PositionMismatch {
                        expected: st.cache_len[op.layer - 1],
                        got: pos + 1,
                    });
                }

                let dim = spec.dim;
                let kv_dim = spec.kv_dim();
                let q_shard = &full[s * dps..(s + 1) * dps];
                let k_shard = &full[dim + s * kvps..dim + (s + 1) * kvps];
                let v_shard = &full[dim + kv_dim + s * kvps..dim + kv_dim + (s + 1) * kvps];

                let stride = spec.max_seq_len * kvps;
                let offset = op.layer * stride + pos * kvps;
                st.k_cache[offset..offset + kvps].copy_from_slice(k_shard);
                st.v_cache[offset..offset + kvps].copy_from_slice(v_shard);
                st.cache_len[op.layer] = pos + 1;

                let k_cache = &st.k_cache[op.layer * stride..(op.layer + 1) * stride];
                let v_cache = &st.v_cache[op.layer * stride..(op.layer + 1) * stride];
                slice_ops::att_heads(
                    spec,
                    pool,
                    q_shard,
                    k_cache,
                    v_cache,
                    pos,
                    &mut st.scores,
                    &mut st.out[..dps],
                );
            }
            OpKind::AttOut => {
                let block = slice_ops::act_block(&input, s * dps, dps);
                slice_ops::matvec_pooled(pool, &layer.wo, block, &mut st.out[..spec.dim]);
            }
            OpKind::FfnGateUp => {
                let FfnSlice::Dense { gate, up, .. } = &layer.ffn else {
                    unreachable!("dense op on an MoE layer");
                };
                slice_ops::gate_up(pool, gate, up, input, &mut st.out[..fps], &mut st.up_scratch);
            }
            OpKind::FfnDown => {
                let FfnSlice::Dense { down, .. } = &layer.ffn else {
                    unreachable!("dense op on an MoE layer");
                };
                let block = slice_ops::act_block(&input, s * fps, fps);
                slice_ops::matvec_pooled(pool, down, block, &mut st.out[..spec.dim]);
            }
            OpKind::MoeGateUp => {
                let FfnSlice::Moe { router, experts } = &layer.ffn else {
                    unreachable!("MoE op on a dense layer");
                };
                match &input {
                    ActVec::F32(xs) => st.moe_in.copy_from_slice(xs),
                    ActVec::Q80(blocks) => dequantize_q80(blocks, &mut st.moe_in, 1, 0),
                }
                slice_ops::moe_route(router, &st.moe_in, &mut st.moe_logits, &mut st.moe_gates);

                let own = spec.n_active_experts * fps;
                slice_ops::moe_gate_up(
                    pool,
                    experts,
                    &st.moe_gates,
                    input,
                    fps,
                    &mut st.out[..own],
                    &mut st.up_scratch,
                );
            }
            OpKind::MoeDown => {
                let FfnSlice::Moe { experts, .. } = &layer.ffn else {
                    unreachable!("MoE op on a dense layer");
                };
                let region_start = s * spec.n_active_experts * fps;
                slice_ops::moe_down_partial(
                    pool,
                    experts,
                    &st.moe_gates,
                    &input,
                    region_start,
                    fps,
                    &mut st.out[..spec.dim],
                    &mut st.tmp,
                );
            }
            OpKind::LmHead => {
                let vps = spec.vocab_per_slice();
                slice_ops::matvec_pooled(pool, &self.weights.lm_head, input, &mut st.out[..vps]);
            }
            _ => unreachable!("{:?} is not a sliced op", op.kind),
        }
        Ok(())
    }
}

fn error_code_for(err: &InferenceError) -> ErrorCode {
    match err {
        InferenceError::PositionMismatch { .. } => ErrorCode::PositionMismatch,
        InferenceError::UnknownOp(_) => ErrorCode::UnknownOp,
        InferenceError::Protocol(ProtocolError::PayloadLength { .. }) => ErrorCode::LengthMismatch,
        InferenceError::Protocol(_) => ErrorCode::TruncatedFrame,
        _ => ErrorCode::Internal,
    }
}
