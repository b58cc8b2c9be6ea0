//! End-to-end cluster tests: a root driver plus worker executors over
//! localhost links, checked against the single-slice reference.

use std::collections::HashMap;
use std::net::TcpListener;
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use meshlm_core::quant::quantize_q80;
use meshlm_core::{BlockQ80, FloatType, BLOCK_SIZE};
use meshlm_inference::{
    generate, push_slices, Driver, FinishReason, GenerateParams, InferenceError, Sampler,
    WorkerExecutor,
};
use meshlm_model::{shard_bytes, Architecture, SliceWeights, TensorId, Tokenizer, TransformerSpec};
use meshlm_protocol::{LinkPool, WorkerLink};

fn dense_spec(n_slices: usize, weight_type: FloatType, buffer_type: FloatType) -> TransformerSpec {
    TransformerSpec {
        arch: Architecture::Llama2,
        n_layers: 2,
        dim: 64,
        n_heads: 8,
        n_kv_heads: 4,
        head_dim: 8,
        ffn_dim: 128,
        n_experts: 0,
        n_active_experts: 0,
        vocab_size: 64,
        max_seq_len: 16,
        weight_type,
        buffer_type,
        rope_theta: 10000.0,
        n_slices,
    }
}

fn moe_spec(n_slices: usize) -> TransformerSpec {
    TransformerSpec {
        arch: Architecture::Mixtral,
        n_experts: 4,
        n_active_experts: 2,
        ..dense_spec(n_slices, FloatType::F32, FloatType::F32)
    }
}

/// Full random tensors keyed by encoded id, shared by every slice count.
fn random_tensors(spec: &TransformerSpec, seed: u64) -> HashMap<u32, Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();
    for id in TensorId::enumerate(spec, 0) {
        let layout = id.layout(spec);
        let n = layout.rows * layout.cols;
        let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let bytes = match layout.float_type {
            FloatType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            FloatType::Q80 => {
                let mut blocks = vec![BlockQ80::zeroed(); n / BLOCK_SIZE];
                quantize_q80(&values, &mut blocks, 1, 0);
                let mut out = Vec::new();
                meshlm_protocol::payload::write_q80(&mut out, &blocks);
                out
            }
            other => panic!("test tensors do not cover {other}"),
        };
        tensors.insert(id.encode(), bytes);
    }
    tensors
}

fn spawn_worker(listener: TcpListener) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let link = WorkerLink::from_stream(stream).unwrap();
        let mut executor = WorkerExecutor::handshake(link, 2).unwrap();
        executor.serve().unwrap();
    })
}

fn build_cluster(
    spec: &TransformerSpec,
    tensors: &HashMap<u32, Vec<u8>>,
) -> (Driver, Vec<JoinHandle<()>>) {
    let n_workers = spec.n_slices - 1;
    let mut addrs = Vec::with_capacity(n_workers);
    let mut handles = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        addrs.push(listener.local_addr().unwrap().to_string());
        handles.push(spawn_worker(listener));
    }

    let mut links = LinkPool::connect(&addrs).unwrap();
    push_slices(&mut links, spec, |id| Ok(tensors[&id.encode()].clone())).unwrap();

    let weights = SliceWeights::from_source::<InferenceError, _>(spec, 0, |id, layout| {
        Ok(shard_bytes(&tensors[&id.encode()], layout, spec.n_slices, 0))
    })
    .unwrap();

    let driver = Driver::new(spec.clone(), weights, links, 2).unwrap();
    (driver, handles)
}

fn logits_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let bound = tol * x.abs().max(1.0);
        assert!((x - y).abs() <= bound, "logit {i}: {x} vs {y}");
    }
}

#[test]
fn four_slices_match_the_single_slice_reference() {
    let spec3 = dense_spec(4, FloatType::F32, FloatType::F32);
    let tensors = random_tensors(&spec3, 11);

    let spec1 = dense_spec(1, FloatType::F32, FloatType::F32);
    let weights1 = SliceWeights::from_source::<InferenceError, _>(&spec1, 0, |id, _| {
        Ok(tensors[&id.encode()].clone())
    })
    .unwrap();
    let mut reference = Driver::new(spec1, weights1, LinkPool::empty(), 2).unwrap();

    let (mut driver, handles) = build_cluster(&spec3, &tensors);

    for (pos, token) in [3u32, 17, 42, 8].into_iter().enumerate() {
        let expected = reference.infer(token, pos as u32).unwrap().to_vec();
        let got = driver.infer(token, pos as u32).unwrap().to_vec();
        logits_close(&expected, &got, 1e-4);
    }

    drop(driver);
    drop(reference);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn quantized_cluster_matches_quantized_reference() {
    let spec2 = dense_spec(2, FloatType::Q80, FloatType::Q80);
    let tensors = random_tensors(&spec2, 23);

    let spec1 = dense_spec(1, FloatType::Q80, FloatType::Q80);
    let weights1 = SliceWeights::from_source::<InferenceError, _>(&spec1, 0, |id, _| {
        Ok(tensors[&id.encode()].clone())
    })
    .unwrap();
    let mut reference = Driver::new(spec1, weights1, LinkPool::empty(), 2).unwrap();

    let (mut driver, handles) = build_cluster(&spec2, &tensors);

    for (pos, token) in [5u32, 60, 2].into_iter().enumerate() {
        let expected = reference.infer(token, pos as u32).unwrap().to_vec();
        let got = driver.infer(token, pos as u32).unwrap().to_vec();
        logits_close(&expected, &got, 1e-2);
    }

    drop(driver);
    drop(reference);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn moe_cluster_matches_reference() {
    let spec2 = moe_spec(2);
    let tensors = random_tensors(&spec2, 31);

    let spec1 = moe_spec(1);
    let weights1 = SliceWeights::from_source::<InferenceError, _>(&spec1, 0, |id, _| {
        Ok(tensors[&id.encode()].clone())
    })
    .unwrap();
    let mut reference = Driver::new(spec1, weights1, LinkPool::empty(), 2).unwrap();

    let (mut driver, handles) = build_cluster(&spec2, &tensors);

    for (pos, token) in [9u32, 33].into_iter().enumerate() {
        let expected = reference.infer(token, pos as u32).unwrap().to_vec();
        let got = driver.infer(token, pos as u32).unwrap().to_vec();
        logits_close(&expected, &got, 1e-4);
    }

    drop(driver);
    drop(reference);
    for handle in handles {
        handle.join().unwrap();
    }
}

fn word_tokenizer(vocab_size: usize) -> Tokenizer {
    // One synthetic piece per token id so generation decodes cleanly.
    let mut entries: Vec<(Vec<u8>, f32)> = vec![(b"<s>".to_vec(), 0.0), (b"</s>".to_vec(), 0.0)];
    for i in 2..vocab_size {
        entries.push((format!("w{i} ").into_bytes(), -(i as f32)));
    }
    Tokenizer::from_parts(entries, 0, 1).unwrap()
}

#[test]
fn greedy_generation_is_reproducible_after_reset() {
    let spec = dense_spec(2, FloatType::F32, FloatType::F32);
    let tensors = random_tensors(&spec, 47);
    let (mut driver, handles) = build_cluster(&spec, &tensors);

    let tokenizer = word_tokenizer(spec.vocab_size);
    let params = GenerateParams {
        max_tokens: 6,
        max_seq_len: spec.max_seq_len,
        stop: Vec::new(),
    };
    let prompt = [2u32, 3, 4];

    let mut run = |driver: &mut Driver| {
        let mut sampler = Sampler::new(spec.vocab_size, 0.0, 0.9, 0);
        let mut pieces = Vec::new();
        let outcome = generate(driver, &tokenizer, &mut sampler, &prompt, &params, |p| {
            pieces.push(p.to_string());
            true
        })
        .unwrap();
        (pieces, outcome)
    };

    let (first, outcome) = run(&mut driver);
    assert_eq!(outcome.prompt_tokens, 3);
    assert!(matches!(outcome.finish, FinishReason::Length | FinishReason::Stop));

    driver.reset().unwrap();
    let (second, _) = run(&mut driver);
    assert_eq!(first, second);

    drop(driver);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn out_of_order_position_is_rejected() {
    let spec = dense_spec(1, FloatType::F32, FloatType::F32);
    let tensors = random_tensors(&spec, 3);
    let weights = SliceWeights::from_source::<InferenceError, _>(&spec, 0, |id, _| {
        Ok(tensors[&id.encode()].clone())
    })
    .unwrap();
    let mut driver = Driver::new(spec, weights, LinkPool::empty(), 1).unwrap();

    let result = driver.infer(1, 5);
    assert!(matches!(result, Err(InferenceError::PositionMismatch { .. })));
}
