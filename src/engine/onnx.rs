//! Causal language model on ONNX Runtime.
//!
//! Expects a decoder-only export with `input_ids` and `attention_mask`
//! inputs (plus `position_ids` when the graph declares it) and a `logits`
//! output of shape `[batch, sequence, vocab]`. Decoding is greedy and
//! recomputes the full sequence each step, which keeps the graph contract
//! small at the cost of speed on long prompts.

use super::{EngineError, InferenceEngine, LanguageModel, ModelSpec};
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Tensor;
use std::collections::HashMap;
use tracing::{debug, info};

/// Special tokens that terminate generation, if the vocabulary has them.
const STOP_TOKENS: [&str; 4] = ["<|end|>", "<|endoftext|>", "<|assistant|>", "</s>"];

/// Loader for ONNX causal language models.
#[derive(Debug, Clone)]
pub struct OnnxEngine {
    intra_threads: usize,
    context_length: usize,
}

impl OnnxEngine {
    pub fn new(context_length: usize) -> Self {
        let intra_threads = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        Self {
            intra_threads,
            context_length,
        }
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LanguageModel>, EngineError> {
        if let Some(missing) = spec.missing_artifact() {
            return Err(EngineError::ArtifactMissing(missing.to_path_buf()));
        }

        info!("Loading ONNX model: {}", spec.model_path.display());
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(self.intra_threads))
            .and_then(|b| b.commit_from_file(&spec.model_path))
            .map_err(|e| EngineError::LoadFailed(format!("session: {e}")))?;

        info!("Loading tokenizer: {}", spec.tokenizer_path.display());
        let tokenizer = tokenizers::Tokenizer::from_file(&spec.tokenizer_path)
            .map_err(|e| EngineError::LoadFailed(format!("tokenizer: {e}")))?;

        let wants_position_ids = session.inputs.iter().any(|i| i.name == "position_ids");
        let stop_ids: Vec<i64> = STOP_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .map(i64::from)
            .collect();

        debug!(
            "ONNX model ready (position_ids: {}, stop tokens: {})",
            wants_position_ids,
            stop_ids.len()
        );

        Ok(Box::new(OnnxModel {
            session,
            tokenizer,
            stop_ids,
            wants_position_ids,
            context_length: self.context_length,
        }))
    }
}

/// A loaded ONNX session and its tokenizer.
struct OnnxModel {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
    stop_ids: Vec<i64>,
    wants_position_ids: bool,
    context_length: usize,
}

impl OnnxModel {
    fn encode(&self, text: &str) -> Result<Vec<i64>, EngineError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    /// Run one forward pass and pick the most likely next token.
    fn next_token(&mut self, ids: &[i64]) -> Result<i64, EngineError> {
        let seq_len = ids.len();
        let tensor_err = |e: ort::Error| EngineError::Inference(format!("tensor: {e}"));

        let ids_tensor = Tensor::from_array(([1, seq_len], ids.to_vec())).map_err(tensor_err)?;
        let mask_tensor = Tensor::from_array(([1, seq_len], vec![1i64; seq_len])).map_err(tensor_err)?;

        let mut feed: HashMap<String, SessionInputValue> = HashMap::new();
        feed.insert("input_ids".to_owned(), ids_tensor.into());
        feed.insert("attention_mask".to_owned(), mask_tensor.into());
        if self.wants_position_ids {
            let positions: Vec<i64> = (0..seq_len as i64).collect();
            let pos_tensor = Tensor::from_array(([1, seq_len], positions)).map_err(tensor_err)?;
            feed.insert("position_ids".to_owned(), pos_tensor.into());
        }

        let outputs = self
            .session
            .run(SessionInputs::from(feed))
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let (_shape, logits) = outputs[0_usize]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("logits: {e}")))?;

        if logits.is_empty() || logits.len() % seq_len != 0 {
            return Err(EngineError::Inference(format!(
                "unexpected logits length {} for {} tokens",
                logits.len(),
                seq_len
            )));
        }

        let vocab = logits.len() / seq_len;
        let last = &logits[(seq_len - 1) * vocab..];
        argmax(last).ok_or_else(|| EngineError::Inference("empty vocabulary".into()))
    }
}

impl LanguageModel for OnnxModel {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(self.encode(text)?.len())
    }

    fn generate(&mut self, prompt: &str, max_tokens: usize) -> Result<String, EngineError> {
        let mut ids = self.encode(prompt)?;
        if ids.is_empty() {
            return Err(EngineError::Inference("prompt encodes to no tokens".into()));
        }

        // Keep the tail of an oversized prompt so the newest turn survives.
        let budget = self.context_length.saturating_sub(max_tokens).max(1);
        if ids.len() > budget {
            debug!("Prompt truncated from {} to {} tokens", ids.len(), budget);
            ids.drain(..ids.len() - budget);
        }

        let prompt_len = ids.len();
        let started = std::time::Instant::now();

        for _ in 0..max_tokens {
            if ids.len() >= self.context_length {
                break;
            }
            let next = self.next_token(&ids)?;
            if self.stop_ids.contains(&next) {
                break;
            }
            ids.push(next);
        }

        let generated: Vec<u32> = ids[prompt_len..]
            .iter()
            .filter_map(|&id| u32::try_from(id).ok())
            .collect();

        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;

        info!(
            "Generated {} tokens in {}ms",
            generated.len(),
            started.elapsed().as_millis()
        );

        Ok(text.trim().to_string())
    }
}

/// Index of the largest value.
fn argmax(values: &[f32]) -> Option<i64> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as i64)
}
