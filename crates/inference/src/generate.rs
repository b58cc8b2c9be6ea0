//! The token generation loop: prefill, sampling, stop detection, and the
//! streaming boundary.

use std::collections::VecDeque;

use meshlm_model::{is_safe_piece, Tokenizer};

use crate::error::{InferenceError, Result};
use crate::sampler::Sampler;

/// Emitted safe pieces kept for stop-string matching.
const STOP_RING: usize = 8;

/// One forward step; implemented by the driver and by test stubs.
pub trait Infer {
    fn infer(&mut self, token: u32, pos: u32) -> Result<&[f32]>;
}

#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub max_tokens: usize,
    /// The model's sequence capacity; positions never reach it.
    pub max_seq_len: usize,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// EOS token or a stop string.
    Stop,
    /// Token budget or sequence limit exhausted.
    Length,
    /// The piece sink refused a piece (client gone); the caller resets the
    /// workers.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub finish: FinishReason,
}

/// Drive the pipeline over a pre-tokenized prompt. Prompt tokens are
/// teacher-forced and never emitted; sampled pieces go to `emit`, which
/// returns `false` when the client is gone.
pub fn generate<I, F>(
    infer: &mut I,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &[u32],
    params: &GenerateParams,
    mut emit: F,
) -> Result<GenerateOutcome>
where
    I: Infer,
    F: FnMut(&str) -> bool,
{
    if prompt.is_empty() {
        return Err(InferenceError::EmptyPrompt);
    }

    let n_prompt = prompt.len();
    let eos_id = tokenizer.eos_id();
    let mut ring: VecDeque<String> = VecDeque::with_capacity(STOP_RING);
    let mut completion_tokens = 0usize;
    let mut finish = FinishReason::Length;

    let mut token = prompt[0];
    let mut pos = 0u32;
    let limit = (n_prompt + params.max_tokens).min(params.max_seq_len);

    while (pos as usize) < limit {
        let logits = infer.infer(token, pos)?;

        if (pos as usize) < n_prompt - 1 {
            // Prefill: teacher-forced, nothing emitted.
            token = prompt[pos as usize + 1];
        } else {
            let prev = token;
            let next = sampler.sample(logits);

            if next == eos_id {
                finish = FinishReason::Stop;
                break;
            }

            let piece = tokenizer.decode(prev, next);
            let safe = is_safe_piece(&piece);

            // A stop string completed by this piece ends the stream before
            // the piece is emitted.
            if safe && !params.stop.is_empty() {
                let mut tail: String = ring.iter().map(String::as_str).collect();
                tail.push_str(&piece);
                if params.stop.iter().any(|stop| tail.contains(stop)) {
                    finish = FinishReason::Stop;
                    break;
                }
            }

            completion_tokens += 1;
            if safe {
                if ring.len() == STOP_RING {
                    ring.pop_front();
                }
                ring.push_back(piece.clone());
            }
            if !emit(&piece) {
                finish = FinishReason::Cancelled;
                break;
            }
            token = next;
        }
        pos += 1;
    }

    Ok(GenerateOutcome {
        prompt_tokens: n_prompt,
        completion_tokens,
        finish,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted logits: returns a one-hot distribution favoring the next
    /// token in the script, recording every (token, pos) it was driven with.
    struct Scripted {
        script: Vec<u32>,
        vocab: usize,
        pub calls: Vec<(u32, u32)>,
        logits: Vec<f32>,
        step: usize,
    }

    impl Scripted {
        fn new(script: Vec<u32>, vocab: usize) -> Self {
            Self { script, vocab, calls: Vec::new(), logits: Vec::new(), step: 0 }
        }
    }

    impl Infer for Scripted {
        fn infer(&mut self, token: u32, pos: u32) -> Result<&[f32]> {
            self.calls.push((token, pos));
            let target = self.script[self.step.min(self.script.len() - 1)];
            self.step += 1;
            self.logits = vec![-10.0; self.vocab];
            self.logits[target as usize] = 10.0;
            Ok(&self.logits)
        }
    }

    fn test_tokenizer() -> Tokenizer {
        let entries: Vec<(Vec<u8>, f32)> = vec![
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
            (b"He".to_vec(), 0.0),
            (b"llo".to_vec(), 0.0),
            (b" wor".to_vec(), 0.0),
            (b"ld".to_vec(), 0.0),
            (b"STOP".to_vec(), 0.0),
            (b"\x00".to_vec(), 0.0), // unsafe control piece
        ];
        Tokenizer::from_parts(entries, 0, 1).unwrap()
    }

    fn params(stop: &[&str]) -> GenerateParams {
        GenerateParams {
            max_tokens: 16,
            max_seq_len: 64,
            stop: stop.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn teacher_forcing_follows_the_prompt() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        // Model always wants token 6; prompt forces 2, 3, 4 first.
        let mut model = Scripted::new(vec![6], 8);

        let mut pieces = Vec::new();
        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2, 3, 4],
            &params(&[]),
            |p| {
                pieces.push(p.to_string());
                true
            },
        )
        .unwrap();

        // Positions 0 and 1 are teacher-forced with prompt tokens.
        assert_eq!(model.calls[0], (2, 0));
        assert_eq!(model.calls[1], (3, 1));
        assert_eq!(model.calls[2], (4, 2));
        assert_eq!(outcome.prompt_tokens, 3);
        assert!(pieces.iter().all(|p| p == "STOP"));
    }

    #[test]
    fn eos_stops_without_emitting() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        let mut model = Scripted::new(vec![2, 1], 8);

        let mut pieces = Vec::new();
        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2],
            &params(&[]),
            |p| {
                pieces.push(p.to_string());
                true
            },
        )
        .unwrap();

        assert_eq!(pieces, vec!["He"]);
        assert_eq!(outcome.completion_tokens, 1);
        assert_eq!(outcome.finish, FinishReason::Stop);
    }

    #[test]
    fn stop_string_suppresses_the_completing_piece() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        // "He" + "llo" emitted, then "STOP" completes the stop word.
        let mut model = Scripted::new(vec![2, 3, 6, 4], 8);

        let mut pieces = Vec::new();
        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2],
            &params(&["STOP"]),
            |p| {
                pieces.push(p.to_string());
                true
            },
        )
        .unwrap();

        assert_eq!(pieces, vec!["He", "llo"]);
        assert_eq!(outcome.finish, FinishReason::Stop);
        assert_eq!(outcome.completion_tokens, 2);
    }

    #[test]
    fn stop_string_matches_across_pieces() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        // "Hello world" assembled from four pieces; stop spans two of them.
        let mut model = Scripted::new(vec![2, 3, 4, 5], 8);

        let mut pieces = Vec::new();
        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2],
            &params(&["o world"]),
            |p| {
                pieces.push(p.to_string());
                true
            },
        )
        .unwrap();

        // "ld" completes "o world" across "llo" + " wor" and is suppressed.
        assert_eq!(pieces, vec!["He", "llo", " wor"]);
        assert_eq!(outcome.finish, FinishReason::Stop);
    }

    #[test]
    fn unsafe_pieces_do_not_match_stop_strings() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        let mut model = Scripted::new(vec![7, 7, 7], 8);

        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2],
            &GenerateParams { max_tokens: 3, max_seq_len: 64, stop: vec!["\u{0}".into()] },
            |_| true,
        )
        .unwrap();

        // The control piece is never safe, so the stop never fires.
        assert_eq!(outcome.finish, FinishReason::Length);
        assert_eq!(outcome.completion_tokens, 3);
    }

    #[test]
    fn sink_refusal_cancels() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        let mut model = Scripted::new(vec![2, 3, 4], 8);

        let mut emitted = 0;
        let outcome = generate(
            &mut model,
            &tokenizer,
            &mut sampler,
            &[2],
            &params(&[]),
            |_| {
                emitted += 1;
                emitted < 2
            },
        )
        .unwrap();

        assert_eq!(outcome.finish, FinishReason::Cancelled);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let tokenizer = test_tokenizer();
        let mut sampler = Sampler::new(8, 0.0, 0.9, 0);
        let mut model = Scripted::new(vec![2], 8);
        let result = generate(&mut model, &tokenizer, &mut sampler, &[], &params(&[]), |_| true);
        assert!(matches!(result, Err(InferenceError::EmptyPrompt)));
    }
}
