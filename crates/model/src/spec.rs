//! Immutable per-run transformer description.

use byteorder::{ByteOrder, LittleEndian};
use meshlm_core::{FloatType, BLOCK_SIZE};

use crate::error::{ModelError, Result};

/// Supported decoder-only architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Architecture {
    Llama2 = 1,
    Grok1 = 2,
    Mixtral = 3,
}

impl Architecture {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Architecture::Llama2),
            2 => Some(Architecture::Grok1),
            3 => Some(Architecture::Mixtral),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// RMS-norm epsilon published per architecture.
    pub fn norm_eps(self) -> f32 {
        match self {
            Architecture::Llama2 | Architecture::Mixtral => 1e-5,
            Architecture::Grok1 => 1e-6,
        }
    }

    pub fn is_moe(self) -> bool {
        matches!(self, Architecture::Grok1 | Architecture::Mixtral)
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Architecture::Llama2 => "llama2",
            Architecture::Grok1 => "grok1",
            Architecture::Mixtral => "mixtral",
        };
        f.write_str(name)
    }
}

/// Everything fixed for one run: geometry, element types, slice count.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerSpec {
    pub arch: Architecture,
    pub n_layers: usize,
    pub dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub ffn_dim: usize,
    pub n_experts: usize,
    pub n_active_experts: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub weight_type: FloatType,
    pub buffer_type: FloatType,
    pub rope_theta: f32,
    /// Workers + 1. The root is slice 0.
    pub n_slices: usize,
}

/// Packed wire length of a spec plus the receiver's slice index.
pub const SPEC_WIRE_LEN: usize = 17 * 4;

impl TransformerSpec {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    pub fn heads_per_slice(&self) -> usize {
        self.n_heads / self.n_slices
    }

    pub fn kv_heads_per_slice(&self) -> usize {
        self.n_kv_heads / self.n_slices
    }

    pub fn dim_per_slice(&self) -> usize {
        self.dim / self.n_slices
    }

    pub fn kv_dim_per_slice(&self) -> usize {
        self.kv_dim() / self.n_slices
    }

    pub fn ffn_per_slice(&self) -> usize {
        self.ffn_dim / self.n_slices
    }

    pub fn vocab_per_slice(&self) -> usize {
        self.vocab_size / self.n_slices
    }

    pub fn norm_eps(&self) -> f32 {
        self.arch.norm_eps()
    }

    /// Check every divisibility constraint the sliced plan relies on.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ModelError::Validation(msg));

        if self.n_slices == 0 {
            return fail("n_slices must be at least 1".into());
        }
        if self.n_layers == 0 || self.max_seq_len == 0 {
            return fail("model must have at least one layer and one position".into());
        }
        if self.n_heads * self.head_dim != self.dim {
            return fail(format!(
                "n_heads {} * head_dim {} != dim {}",
                self.n_heads, self.head_dim, self.dim
            ));
        }
        if self.head_dim % 2 != 0 {
            return fail(format!("head_dim {} must be even for rotary pairs", self.head_dim));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return fail(format!(
                "n_heads {} not a multiple of n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            ));
        }
        for (name, value) in [
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("ffn_dim", self.ffn_dim),
            ("vocab_size", self.vocab_size),
        ] {
            if value % self.n_slices != 0 {
                return fail(format!("{name} {value} not divisible by {} slices", self.n_slices));
            }
        }
        if self.arch.is_moe() {
            if self.n_experts == 0 || self.n_active_experts == 0 {
                return fail(format!("{} requires experts", self.arch));
            }
            if self.n_active_experts > self.n_experts {
                return fail(format!(
                    "n_active_experts {} > n_experts {}",
                    self.n_active_experts, self.n_experts
                ));
            }
        }
        if matches!(self.weight_type, FloatType::Q40 | FloatType::Q80) {
            // Sliced matmul row lengths must stay whole blocks: full rows of
            // dim and ffn_dim, and the per-slice column blocks of the reduce
            // projections.
            for (name, value) in [
                ("dim", self.dim),
                ("ffn_dim", self.ffn_dim),
                ("dim / n_slices", self.dim_per_slice()),
                ("ffn_dim / n_slices", self.ffn_per_slice()),
            ] {
                if value % BLOCK_SIZE != 0 {
                    return fail(format!("{name} = {value} is not a multiple of {BLOCK_SIZE}"));
                }
            }
        }
        if self.buffer_type == FloatType::Q80 {
            for (name, value) in [
                ("dim", self.dim),
                ("dim / n_slices", self.dim_per_slice()),
                ("ffn_dim / n_slices", self.ffn_per_slice()),
            ] {
                if value % BLOCK_SIZE != 0 {
                    return fail(format!(
                        "{name} = {value} is not a multiple of {BLOCK_SIZE} (q80 buffers)"
                    ));
                }
            }
        }
        if !matches!(self.buffer_type, FloatType::F32 | FloatType::Q80) {
            return fail(format!("buffer type {} is not supported", self.buffer_type));
        }
        Ok(())
    }

    /// Pack the spec plus the receiving worker's slice index for the `Spec`
    /// handshake frame.
    pub fn to_wire(&self, slice_idx: usize) -> Vec<u8> {
        let mut buf = vec![0u8; SPEC_WIRE_LEN];
        let words = [
            self.arch.to_u32(),
            self.n_layers as u32,
            self.dim as u32,
            self.n_heads as u32,
            self.n_kv_heads as u32,
            self.head_dim as u32,
            self.ffn_dim as u32,
            self.n_experts as u32,
            self.n_active_experts as u32,
            self.vocab_size as u32,
            self.max_seq_len as u32,
            self.weight_type.to_u32(),
            self.buffer_type.to_u32(),
            self.rope_theta.to_bits(),
            self.n_slices as u32,
            slice_idx as u32,
            0, // reserved
        ];
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[i * 4..], *w);
        }
        buf
    }

    /// Inverse of [`TransformerSpec::to_wire`]; returns the spec and the
    /// receiver's slice index.
    pub fn from_wire(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() != SPEC_WIRE_LEN {
            return Err(ModelError::InvalidFormat(format!(
                "spec payload is {} bytes, expected {SPEC_WIRE_LEN}",
                bytes.len()
            )));
        }
        let word = |i: usize| LittleEndian::read_u32(&bytes[i * 4..]);
        let arch = Architecture::from_u32(word(0))
            .ok_or_else(|| ModelError::InvalidFormat(format!("unknown architecture {}", word(0))))?;
        let weight_type = FloatType::from_u32(word(11))
            .ok_or_else(|| ModelError::InvalidFormat(format!("unknown weight type {}", word(11))))?;
        let buffer_type = FloatType::from_u32(word(12))
            .ok_or_else(|| ModelError::InvalidFormat(format!("unknown buffer type {}", word(12))))?;

        let spec = Self {
            arch,
            n_layers: word(1) as usize,
            dim: word(2) as usize,
            n_heads: word(3) as usize,
            n_kv_heads: word(4) as usize,
            head_dim: word(5) as usize,
            ffn_dim: word(6) as usize,
            n_experts: word(7) as usize,
            n_active_experts: word(8) as usize,
            vocab_size: word(9) as usize,
            max_seq_len: word(10) as usize,
            weight_type,
            buffer_type,
            rope_theta: f32::from_bits(word(13)),
            n_slices: word(14) as usize,
        };
        let slice_idx = word(15) as usize;
        if slice_idx >= spec.n_slices {
            return Err(ModelError::InvalidFormat(format!(
                "slice index {slice_idx} out of range for {} slices",
                spec.n_slices
            )));
        }
        spec.validate()?;
        Ok((spec, slice_idx))
    }
}
