//! Sliced weight containers.
//!
//! Every layer weight is cut into `n_slices` shards: projections whose output
//! dimension decomposes by slice are cut along rows, the two reduce
//! projections (attention output, FFN down) along column blocks, and the
//! small norm/router tensors are replicated. The root keeps slice 0 and
//! pushes slice `k + 1` to worker `k` during the handshake; both sides build
//! the same [`SliceWeights`] from the same canonical tensor order.

use meshlm_core::kernels::Mat;
use meshlm_core::{FloatType, BLOCK_SIZE};

use crate::error::ModelError;
use crate::spec::TransformerSpec;

/// Named weight within the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TensorKind {
    TokenEmbedding = 1,
    AttNorm = 2,
    Wq = 3,
    Wk = 4,
    Wv = 5,
    Wo = 6,
    FfnNorm = 7,
    Gate = 8,
    Down = 9,
    Up = 10,
    Router = 11,
    FinalNorm = 12,
    LmHead = 13,
}

impl TensorKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TensorKind::TokenEmbedding),
            2 => Some(TensorKind::AttNorm),
            3 => Some(TensorKind::Wq),
            4 => Some(TensorKind::Wk),
            5 => Some(TensorKind::Wv),
            6 => Some(TensorKind::Wo),
            7 => Some(TensorKind::FfnNorm),
            8 => Some(TensorKind::Gate),
            9 => Some(TensorKind::Down),
            10 => Some(TensorKind::Up),
            11 => Some(TensorKind::Router),
            12 => Some(TensorKind::FinalNorm),
            13 => Some(TensorKind::LmHead),
            _ => None,
        }
    }
}

/// How a tensor is distributed across slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharding {
    /// Lives on the root only (embedding table, final norm).
    RootOnly,
    /// Full copy on every slice (norms, MoE router).
    Replicated,
    /// Outer dimension cut into contiguous row blocks.
    Rows,
    /// Inner dimension cut into per-row column blocks.
    Columns,
}

/// A tensor address: kind, layer, and expert for MoE banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorId {
    pub kind: TensorKind,
    pub layer: u32,
    pub expert: u32,
}

/// Shape and distribution of one tensor, derived from the spec.
#[derive(Debug, Clone, Copy)]
pub struct TensorLayout {
    pub rows: usize,
    pub cols: usize,
    pub float_type: FloatType,
    pub sharding: Sharding,
}

impl TensorLayout {
    pub fn full_bytes(&self) -> usize {
        self.float_type.bytes_for(self.rows * self.cols)
    }

    /// Dimensions of one slice's shard.
    pub fn shard_dims(&self, n_slices: usize) -> (usize, usize) {
        match self.sharding {
            Sharding::RootOnly | Sharding::Replicated => (self.rows, self.cols),
            Sharding::Rows => (self.rows / n_slices, self.cols),
            Sharding::Columns => (self.rows, self.cols / n_slices),
        }
    }

    pub fn shard_bytes_len(&self, n_slices: usize) -> usize {
        let (rows, cols) = self.shard_dims(n_slices);
        self.float_type.bytes_for(rows * cols)
    }
}

impl TensorId {
    pub fn global(kind: TensorKind) -> Self {
        Self { kind, layer: 0, expert: 0 }
    }

    pub fn layered(kind: TensorKind, layer: usize) -> Self {
        Self { kind, layer: layer as u32, expert: 0 }
    }

    pub fn expert(kind: TensorKind, layer: usize, expert: usize) -> Self {
        Self { kind, layer: layer as u32, expert: expert as u32 }
    }

    /// Pack into the `u32` carried by a `Weights` frame.
    pub fn encode(&self) -> u32 {
        ((self.kind as u32) << 24) | (self.layer << 8) | self.expert
    }

    pub fn decode(value: u32) -> Option<Self> {
        let kind = TensorKind::from_u8((value >> 24) as u8)?;
        Some(Self {
            kind,
            layer: (value >> 8) & 0xFFFF,
            expert: value & 0xFF,
        })
    }

    pub fn name(&self) -> String {
        match self.kind {
            TensorKind::TokenEmbedding => "token_embedding".into(),
            TensorKind::FinalNorm => "final_norm".into(),
            TensorKind::LmHead => "lm_head".into(),
            TensorKind::Router => format!("layers.{}.router", self.layer),
            TensorKind::Gate | TensorKind::Down | TensorKind::Up => {
                let name = match self.kind {
                    TensorKind::Gate => "gate",
                    TensorKind::Down => "down",
                    _ => "up",
                };
                format!("layers.{}.expert.{}.{}", self.layer, self.expert, name)
            }
            other => {
                let name = match other {
                    TensorKind::AttNorm => "att_norm",
                    TensorKind::Wq => "wq",
                    TensorKind::Wk => "wk",
                    TensorKind::Wv => "wv",
                    TensorKind::Wo => "wo",
                    _ => "ffn_norm",
                };
                format!("layers.{}.{}", self.layer, name)
            }
        }
    }

    /// Shape, stored element type and distribution of this tensor. Norms and
    /// the router stay F32 in every weight-type configuration.
    pub fn layout(&self, spec: &TransformerSpec) -> TensorLayout {
        let wt = spec.weight_type;
        let (rows, cols, float_type, sharding) = match self.kind {
            TensorKind::TokenEmbedding => (spec.vocab_size, spec.dim, wt, Sharding::RootOnly),
            TensorKind::AttNorm | TensorKind::FfnNorm => {
                (1, spec.dim, FloatType::F32, Sharding::Replicated)
            }
            TensorKind::Wq => (spec.dim, spec.dim, wt, Sharding::Rows),
            TensorKind::Wk | TensorKind::Wv => (spec.kv_dim(), spec.dim, wt, Sharding::Rows),
            TensorKind::Wo => (spec.dim, spec.dim, wt, Sharding::Columns),
            TensorKind::Gate | TensorKind::Up => (spec.ffn_dim, spec.dim, wt, Sharding::Rows),
            TensorKind::Down => (spec.dim, spec.ffn_dim, wt, Sharding::Columns),
            TensorKind::Router => (spec.n_experts, spec.dim, FloatType::F32, Sharding::Replicated),
            TensorKind::FinalNorm => (1, spec.dim, FloatType::F32, Sharding::RootOnly),
            TensorKind::LmHead => (spec.vocab_size, spec.dim, wt, Sharding::Rows),
        };
        TensorLayout { rows, cols, float_type, sharding }
    }

    /// Canonical tensor order. Both the file layout and the handshake stream
    /// follow it; non-zero slices drop the root-only tensors.
    pub fn enumerate(spec: &TransformerSpec, for_slice: usize) -> Vec<TensorId> {
        let mut ids = Vec::new();
        let root = for_slice == 0;
        if root {
            ids.push(TensorId::global(TensorKind::TokenEmbedding));
        }
        for layer in 0..spec.n_layers {
            ids.push(TensorId::layered(TensorKind::AttNorm, layer));
            ids.push(TensorId::layered(TensorKind::Wq, layer));
            ids.push(TensorId::layered(TensorKind::Wk, layer));
            ids.push(TensorId::layered(TensorKind::Wv, layer));
            ids.push(TensorId::layered(TensorKind::Wo, layer));
            ids.push(TensorId::layered(TensorKind::FfnNorm, layer));
            if spec.arch.is_moe() {
                ids.push(TensorId::layered(TensorKind::Router, layer));
                for expert in 0..spec.n_experts {
                    ids.push(TensorId::expert(TensorKind::Gate, layer, expert));
                    ids.push(TensorId::expert(TensorKind::Down, layer, expert));
                    ids.push(TensorId::expert(TensorKind::Up, layer, expert));
                }
            } else {
                ids.push(TensorId::expert(TensorKind::Gate, layer, 0));
                ids.push(TensorId::expert(TensorKind::Down, layer, 0));
                ids.push(TensorId::expert(TensorKind::Up, layer, 0));
            }
        }
        if root {
            ids.push(TensorId::global(TensorKind::FinalNorm));
        }
        ids.push(TensorId::global(TensorKind::LmHead));
        ids
    }
}

/// Cut one slice's shard out of a full tensor, in the tensor's native block
/// space. Row shards are contiguous; column shards gather one block range
/// per row.
pub fn shard_bytes(
    full: &[u8],
    layout: &TensorLayout,
    n_slices: usize,
    slice_idx: usize,
) -> Vec<u8> {
    assert_eq!(full.len(), layout.full_bytes());
    match layout.sharding {
        Sharding::RootOnly | Sharding::Replicated => full.to_vec(),
        Sharding::Rows => {
            let rows_per_slice = layout.rows / n_slices;
            let row_bytes = layout.float_type.bytes_for(layout.cols);
            let start = slice_idx * rows_per_slice * row_bytes;
            full[start..start + rows_per_slice * row_bytes].to_vec()
        }
        Sharding::Columns => {
            // Columns move in whole quantization blocks for blocked types,
            // single elements otherwise.
            let unit = match layout.float_type {
                FloatType::Q40 | FloatType::Q80 => BLOCK_SIZE,
                _ => 1,
            };
            assert!(layout.cols % (n_slices * unit) == 0);
            let row_bytes = layout.float_type.bytes_for(layout.cols);
            let shard_cols = layout.cols / n_slices;
            let shard_row_bytes = layout.float_type.bytes_for(shard_cols);
            let offset = slice_idx * shard_row_bytes;

            let mut out = Vec::with_capacity(layout.rows * shard_row_bytes);
            for row in 0..layout.rows {
                let start = row * row_bytes + offset;
                out.extend_from_slice(&full[start..start + shard_row_bytes]);
            }
            out
        }
    }
}

fn f32s_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Dense or mixture-of-experts FFN weights for one layer slice.
pub enum FfnSlice {
    Dense {
        gate: Mat,
        up: Mat,
        down: Mat,
    },
    Moe {
        /// Replicated router, always F32; every slice routes identically.
        router: Mat,
        experts: Vec<ExpertSlice>,
    },
}

pub struct ExpertSlice {
    pub gate: Mat,
    pub up: Mat,
    pub down: Mat,
}

/// One transformer layer's shard.
pub struct LayerSlice {
    pub att_norm: Vec<f32>,
    pub wq: Mat,
    pub wk: Mat,
    pub wv: Mat,
    pub wo: Mat,
    pub ffn_norm: Vec<f32>,
    pub ffn: FfnSlice,
}

/// All weights owned by one slice. The root (slice 0) additionally holds the
/// embedding table and the final norm.
pub struct SliceWeights {
    pub slice_idx: usize,
    pub token_embedding: Option<Mat>,
    pub layers: Vec<LayerSlice>,
    pub final_norm: Option<Vec<f32>>,
    pub lm_head: Mat,
}

impl SliceWeights {
    /// Build a slice by pulling every tensor shard from `fetch` in canonical
    /// order. The root fetches from the weight file, a worker from its link;
    /// both observe the identical sequence of ids.
    pub fn from_source<E, F>(
        spec: &TransformerSpec,
        slice_idx: usize,
        mut fetch: F,
    ) -> std::result::Result<Self, E>
    where
        E: From<ModelError>,
        F: FnMut(TensorId, &TensorLayout) -> std::result::Result<Vec<u8>, E>,
    {
        let n = spec.n_slices;
        let mat = |id: TensorId, fetch: &mut F| -> std::result::Result<Mat, E> {
            let layout = id.layout(spec);
            let bytes = fetch(id, &layout)?;
            let (rows, cols) = layout.shard_dims(n);
            if bytes.len() != layout.float_type.bytes_for(rows * cols) {
                return Err(ModelError::InvalidFormat(format!(
                    "tensor {} shard has {} bytes, expected {}",
                    id.name(),
                    bytes.len(),
                    layout.float_type.bytes_for(rows * cols)
                ))
                .into());
            }
            Ok(Mat::from_bytes(layout.float_type, rows, cols, &bytes))
        };
        let norm = |id: TensorId, fetch: &mut F| -> std::result::Result<Vec<f32>, E> {
            let layout = id.layout(spec);
            Ok(f32s_from_bytes(&fetch(id, &layout)?))
        };

        let token_embedding = if slice_idx == 0 {
            Some(mat(TensorId::global(TensorKind::TokenEmbedding), &mut fetch)?)
        } else {
            None
        };

        let mut layers = Vec::with_capacity(spec.n_layers);
        for layer in 0..spec.n_layers {
            let att_norm = norm(TensorId::layered(TensorKind::AttNorm, layer), &mut fetch)?;
            let wq = mat(TensorId::layered(TensorKind::Wq, layer), &mut fetch)?;
            let wk = mat(TensorId::layered(TensorKind::Wk, layer), &mut fetch)?;
            let wv = mat(TensorId::layered(TensorKind::Wv, layer), &mut fetch)?;
            let wo = mat(TensorId::layered(TensorKind::Wo, layer), &mut fetch)?;
            let ffn_norm = norm(TensorId::layered(TensorKind::FfnNorm, layer), &mut fetch)?;

            let ffn = if spec.arch.is_moe() {
                let router = mat(TensorId::layered(TensorKind::Router, layer), &mut fetch)?;
                let mut experts = Vec::with_capacity(spec.n_experts);
                for expert in 0..spec.n_experts {
                    experts.push(ExpertSlice {
                        gate: mat(TensorId::expert(TensorKind::Gate, layer, expert), &mut fetch)?,
                        down: mat(TensorId::expert(TensorKind::Down, layer, expert), &mut fetch)?,
                        up: mat(TensorId::expert(TensorKind::Up, layer, expert), &mut fetch)?,
                    });
                }
                FfnSlice::Moe { router, experts }
            } else {
                FfnSlice::Dense {
                    gate: mat(TensorId::expert(TensorKind::Gate, layer, 0), &mut fetch)?,
                    down: mat(TensorId::expert(TensorKind::Down, layer, 0), &mut fetch)?,
                    up: mat(TensorId::expert(TensorKind::Up, layer, 0), &mut fetch)?,
                }
            };

            layers.push(LayerSlice { att_norm, wq, wk, wv, wo, ffn_norm, ffn });
        }

        let final_norm = if slice_idx == 0 {
            Some(norm(TensorId::global(TensorKind::FinalNorm), &mut fetch)?)
        } else {
            None
        };
        let lm_head = mat(TensorId::global(TensorKind::LmHead), &mut fetch)?;

        Ok(Self { slice_idx, token_embedding, layers, final_norm, lm_head })
    }
}
