//! Memory-mapped weight-file reader.
//!
//! File layout (`MLMW`, version 1, little-endian): a 60-byte header carrying
//! the model geometry and weight element type, followed by every tensor in
//! canonical order, each stored raw and unsliced in the weight type. Norm
//! vectors and MoE routers are stored F32.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use meshlm_core::FloatType;

use crate::error::{ModelError, Result};
use crate::spec::{Architecture, TransformerSpec};
use crate::weights::{shard_bytes, TensorId};

const MAGIC: [u8; 4] = *b"MLMW";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 60;

pub struct WeightsFile {
    mmap: Mmap,
    spec: TransformerSpec,
    offsets: HashMap<u32, (usize, usize)>,
}

impl WeightsFile {
    /// Map a weight file and index its tensors. `n_slices` and the runtime
    /// buffer type come from the command line; the geometry and weight type
    /// come from the header.
    pub fn open(path: &Path, n_slices: usize, buffer_type: FloatType) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(ModelError::InvalidFormat("file shorter than header".into()));
        }
        if mmap[..4] != MAGIC {
            return Err(ModelError::InvalidMagic);
        }
        let word = |i: usize| LittleEndian::read_u32(&mmap[4 + i * 4..]);
        let version = word(0);
        if version != VERSION {
            return Err(ModelError::UnsupportedVersion(version));
        }

        let arch = Architecture::from_u32(word(1))
            .ok_or_else(|| ModelError::InvalidFormat(format!("unknown architecture {}", word(1))))?;
        let weight_type = FloatType::from_u32(word(12))
            .ok_or_else(|| ModelError::InvalidFormat(format!("unknown weight type {}", word(12))))?;

        let spec = TransformerSpec {
            arch,
            n_layers: word(2) as usize,
            dim: word(3) as usize,
            n_heads: word(4) as usize,
            n_kv_heads: word(5) as usize,
            head_dim: word(6) as usize,
            ffn_dim: word(7) as usize,
            n_experts: word(8) as usize,
            n_active_experts: word(9) as usize,
            vocab_size: word(10) as usize,
            max_seq_len: word(11) as usize,
            weight_type,
            buffer_type,
            rope_theta: f32::from_bits(word(13)),
            n_slices,
        };
        spec.validate()?;

        let mut offsets = HashMap::new();
        let mut cursor = HEADER_LEN;
        for id in TensorId::enumerate(&spec, 0) {
            let len = id.layout(&spec).full_bytes();
            offsets.insert(id.encode(), (cursor, len));
            cursor += len;
        }
        if cursor != mmap.len() {
            return Err(ModelError::InvalidFormat(format!(
                "file is {} bytes, tensor index expects {cursor}",
                mmap.len()
            )));
        }

        tracing::info!(
            arch = %spec.arch,
            n_layers = spec.n_layers,
            dim = spec.dim,
            weight_type = %spec.weight_type,
            n_slices,
            "mapped weight file"
        );
        Ok(Self { mmap, spec, offsets })
    }

    pub fn spec(&self) -> &TransformerSpec {
        &self.spec
    }

    /// Raw bytes of a full tensor.
    pub fn tensor_bytes(&self, id: TensorId) -> Result<&[u8]> {
        let (start, len) = self
            .offsets
            .get(&id.encode())
            .copied()
            .ok_or_else(|| ModelError::MissingTensor(id.name()))?;
        Ok(&self.mmap[start..start + len])
    }

    /// One slice's shard of a tensor, cut in native block space.
    pub fn shard(&self, id: TensorId, slice_idx: usize) -> Result<Vec<u8>> {
        let layout = id.layout(&self.spec);
        let full = self.tensor_bytes(id)?;
        Ok(shard_bytes(full, &layout, self.spec.n_slices, slice_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::TensorKind;
    use std::io::Write;

    /// Serialize a header + zeroed tensors for a given spec.
    pub(crate) fn write_test_file(path: &Path, spec: &TransformerSpec) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        for w in [
            VERSION,
            spec.arch.to_u32(),
            spec.n_layers as u32,
            spec.dim as u32,
            spec.n_heads as u32,
            spec.n_kv_heads as u32,
            spec.head_dim as u32,
            spec.ffn_dim as u32,
            spec.n_experts as u32,
            spec.n_active_experts as u32,
            spec.vocab_size as u32,
            spec.max_seq_len as u32,
            spec.weight_type.to_u32(),
            spec.rope_theta.to_bits(),
        ] {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(buf.len(), HEADER_LEN);
        for id in TensorId::enumerate(spec, 0) {
            buf.extend(std::iter::repeat(0u8).take(id.layout(spec).full_bytes()));
        }
        let mut file = File::create(path).unwrap();
        file.write_all(&buf).unwrap();
    }

    fn tiny_spec() -> TransformerSpec {
        TransformerSpec {
            arch: Architecture::Llama2,
            n_layers: 2,
            dim: 8,
            n_heads: 2,
            n_kv_heads: 2,
            head_dim: 4,
            ffn_dim: 16,
            n_experts: 0,
            n_active_experts: 0,
            vocab_size: 16,
            max_seq_len: 8,
            weight_type: FloatType::F32,
            buffer_type: FloatType::F32,
            rope_theta: 10000.0,
            n_slices: 2,
        }
    }

    #[test]
    fn open_indexes_every_tensor() {
        let dir = std::env::temp_dir().join("meshlm-loader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tiny.mlmw");
        let spec = tiny_spec();
        write_test_file(&path, &spec);

        let file = WeightsFile::open(&path, 2, FloatType::F32).unwrap();
        assert_eq!(file.spec(), &spec);

        for id in TensorId::enumerate(&spec, 0) {
            let bytes = file.tensor_bytes(id).unwrap();
            assert_eq!(bytes.len(), id.layout(&spec).full_bytes());
        }

        let shard = file.shard(TensorId::layered(TensorKind::Wq, 0), 1).unwrap();
        assert_eq!(shard.len(), TensorId::layered(TensorKind::Wq, 0).layout(&spec).shard_bytes_len(2));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = std::env::temp_dir().join("meshlm-loader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.mlmw");
        std::fs::write(&path, b"nope, not a weight file at all....").unwrap();

        let result = WeightsFile::open(&path, 1, FloatType::F32);
        assert!(matches!(result, Err(ModelError::InvalidMagic)));
    }
}
