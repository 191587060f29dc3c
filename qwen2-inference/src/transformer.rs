//! The Qwen2 decoder-only transformer.
//!
//! **Architecture:**
//! - Grouped Query Attention: `n_kv_heads` key/value heads shared by
//!   `n_heads` query heads, shrinking the KV cache
//! - Rotary position embedding on query and key heads, from tables
//!   precomputed over the whole context window
//! - RMSNorm before the attention and feed-forward blocks, plus a final norm
//! - SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`
//! - Per-projection biases on Q, K and V, the Qwen2 signature
//!
//! Weights are read straight out of the memory-mapped GGUF file and stay
//! quantized; activations are f32 buffers preallocated in [`State`] and
//! reused for every step. The two data-parallel regions (matmul rows,
//! attention heads) fan out through rayon and join before returning.

use crate::gguf::GgufFile;
use crate::tensor::{add_in_place, matmul, mul_in_place, rmsnorm, rmsnorm_in_place, softmax, Tensor};
use crate::tokenizer::Tokenizer;
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Model shape and numerics, fixed at load time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedding width.
    pub dim: usize,
    /// Feed-forward inner width.
    pub hidden_dim: usize,
    pub n_layers: usize,
    /// Query head count.
    pub n_heads: usize,
    /// Key/value head count; divides `n_heads`.
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Maximum sequence length the KV cache is sized for.
    pub context_length: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    /// `dim / n_heads`, even so RoPE can rotate pairs.
    pub head_size: usize,
}

impl Config {
    fn from_gguf(gguf: &GgufFile, vocab_size: usize, ctx_override: Option<usize>) -> Result<Self> {
        let dim = gguf.require_usize("qwen2.embedding_length")?;
        let hidden_dim = gguf.require_usize("qwen2.feed_forward_length")?;
        let n_layers = gguf.require_usize("qwen2.block_count")?;
        let n_heads = gguf.require_usize("qwen2.attention.head_count")?;
        let n_kv_heads = gguf.usize_or("qwen2.attention.head_count_kv", n_heads)?;
        let model_context = gguf.require_usize("qwen2.context_length")?;
        let rms_norm_eps = gguf.require_f32("qwen2.attention.layer_norm_rms_epsilon")?;
        let rope_theta = gguf.require_f32("qwen2.rope.freq_base")?;

        let context_length = match ctx_override {
            Some(requested) if requested < model_context => requested,
            _ => model_context,
        };

        for (name, value) in [
            ("embedding_length", dim),
            ("feed_forward_length", hidden_dim),
            ("block_count", n_layers),
            ("attention.head_count", n_heads),
            ("attention.head_count_kv", n_kv_heads),
            ("context_length", context_length),
        ] {
            if value == 0 {
                anyhow::bail!("Invalid qwen2.{name}: must be positive");
            }
        }
        if dim % n_heads != 0 {
            anyhow::bail!("Embedding width {dim} is not divisible by {n_heads} heads");
        }
        if n_heads % n_kv_heads != 0 {
            anyhow::bail!("Head count {n_heads} is not divisible by {n_kv_heads} KV heads");
        }
        let head_size = dim / n_heads;
        if head_size % 2 != 0 {
            anyhow::bail!("Head size {head_size} must be even for rotary embedding");
        }

        Ok(Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            context_length,
            rms_norm_eps,
            rope_theta,
            head_size,
        })
    }

    /// Width of the key/value vectors for one position.
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query heads per key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// Precomputed rotary tables: `cos(p * freq_i)` and `sin(p * freq_i)` for
/// every position and every even dimension pair of a head.
#[derive(Debug)]
pub struct RopeTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    half_size: usize,
}

impl RopeTable {
    pub fn precompute(context_length: usize, head_size: usize, theta: f32) -> Self {
        debug_assert_eq!(head_size % 2, 0);
        let half_size = head_size / 2;
        let mut cos = Vec::with_capacity(context_length * half_size);
        let mut sin = Vec::with_capacity(context_length * half_size);
        for pos in 0..context_length {
            for i in (0..head_size).step_by(2) {
                let freq = 1.0 / theta.powf(i as f32 / head_size as f32);
                let angle = pos as f32 * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        Self { cos, sin, half_size }
    }

    /// Rotates one head in place. Pair members sit `head_size / 2` apart:
    /// `(a, b) -> (a*cos - b*sin, a*sin + b*cos)`.
    pub fn apply(&self, pos: usize, head: &mut [f32]) {
        let half = head.len() / 2;
        debug_assert_eq!(half, self.half_size);
        let base = pos * self.half_size;
        let (re, im) = head.split_at_mut(half);
        for (ic, (a, b)) in re.iter_mut().zip(im.iter_mut()).enumerate() {
            let (c, s) = (self.cos[base + ic], self.sin[base + ic]);
            let (a0, b0) = (*a, *b);
            *a = a0 * c - b0 * s;
            *b = a0 * s + b0 * c;
        }
    }
}

/// Per-layer weight views. Biases are applied when the export carries them.
struct LayerWeights {
    rms_att: Vec<f32>,
    wq: Tensor,
    wk: Tensor,
    wv: Tensor,
    wo: Tensor,
    q_bias: Option<Vec<f32>>,
    k_bias: Option<Vec<f32>>,
    v_bias: Option<Vec<f32>>,
    rms_ffn: Vec<f32>,
    w_gate: Tensor,
    w_down: Tensor,
    w_up: Tensor,
}

struct Weights {
    token_embedding: Tensor,
    layers: Vec<LayerWeights>,
    rms_final: Vec<f32>,
    rope: RopeTable,
    /// Classifier projection; aliases `token_embedding` when the file has no
    /// separate `output.weight` (tied embeddings share the same bytes).
    wcls: Tensor,
}

impl Weights {
    fn load(gguf: &GgufFile, config: &Config) -> Result<Self> {
        let kv_dim = config.kv_dim();

        let tensor = |name: &str, expected: usize| -> Result<Tensor> {
            let view = Tensor::from_entry(name, gguf.require_tensor(name)?)?;
            if view.len() != expected {
                anyhow::bail!(
                    "Tensor '{name}' holds {} elements, expected {expected}",
                    view.len()
                );
            }
            Ok(view)
        };
        let norm_weights = |name: &str| -> Result<Vec<f32>> {
            Ok(tensor(name, config.dim)?.to_vec())
        };
        let bias = |name: &str, expected: usize| -> Result<Option<Vec<f32>>> {
            match gguf.tensor(name) {
                Some(entry) => {
                    let view = Tensor::from_entry(name, entry)?;
                    if view.len() != expected {
                        anyhow::bail!(
                            "Tensor '{name}' holds {} elements, expected {expected}",
                            view.len()
                        );
                    }
                    Ok(Some(view.to_vec()))
                }
                None => Ok(None),
            }
        };

        let token_embedding = tensor("token_embd.weight", config.vocab_size * config.dim)?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let name = |suffix: &str| format!("blk.{i}.{suffix}");
            layers.push(LayerWeights {
                rms_att: norm_weights(&name("attn_norm.weight"))?,
                wq: tensor(&name("attn_q.weight"), config.dim * config.dim)?,
                wk: tensor(&name("attn_k.weight"), kv_dim * config.dim)?,
                wv: tensor(&name("attn_v.weight"), kv_dim * config.dim)?,
                wo: tensor(&name("attn_output.weight"), config.dim * config.dim)?,
                q_bias: bias(&name("attn_q.bias"), config.dim)?,
                k_bias: bias(&name("attn_k.bias"), kv_dim)?,
                v_bias: bias(&name("attn_v.bias"), kv_dim)?,
                rms_ffn: norm_weights(&name("ffn_norm.weight"))?,
                w_gate: tensor(&name("ffn_gate.weight"), config.hidden_dim * config.dim)?,
                w_down: tensor(&name("ffn_down.weight"), config.dim * config.hidden_dim)?,
                w_up: tensor(&name("ffn_up.weight"), config.hidden_dim * config.dim)?,
            });
        }

        let rms_final = norm_weights("output_norm.weight")?;
        let rope = RopeTable::precompute(config.context_length, config.head_size, config.rope_theta);
        let wcls = match gguf.tensor("output.weight") {
            Some(entry) => Tensor::from_entry("output.weight", entry)?,
            None => token_embedding.clone(),
        };

        Ok(Self { token_embedding, layers, rms_final, rope, wcls })
    }
}

/// Mutable per-session buffers: the activation wave for one step plus the
/// KV cache. Allocated once, reused across steps, owned by a single
/// generation session.
pub struct State {
    /// Residual stream. [dim]
    x: Vec<f32>,
    /// Normalized input of the current block. [dim]
    xb: Vec<f32>,
    /// Attention output projection scratch. [dim]
    xb2: Vec<f32>,
    /// Gate projection. [hidden_dim]
    hb: Vec<f32>,
    /// Up projection. [hidden_dim]
    hb2: Vec<f32>,
    /// Query vector. [dim]
    q: Vec<f32>,
    /// Key vector for the current position. [kv_dim]
    k: Vec<f32>,
    /// Value vector for the current position. [kv_dim]
    v: Vec<f32>,
    /// Attention scores. [n_heads, context_length]
    att: Vec<f32>,
    logits: Vec<f32>,
    /// Per-layer caches. [context_length, kv_dim] each
    key_cache: Vec<Vec<f32>>,
    value_cache: Vec<Vec<f32>>,
    /// Token the next forward step consumes.
    pub latest_token: usize,
}

impl State {
    fn new(config: &Config, initial_token: usize) -> Self {
        let kv_dim = config.kv_dim();
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; config.n_heads * config.context_length],
            logits: vec![0.0; config.vocab_size],
            key_cache: (0..config.n_layers)
                .map(|_| vec![0.0; config.context_length * kv_dim])
                .collect(),
            value_cache: (0..config.n_layers)
                .map(|_| vec![0.0; config.context_length * kv_dim])
                .collect(),
            latest_token: initial_token,
        }
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn logits_mut(&mut self) -> &mut [f32] {
        &mut self.logits
    }
}

/// A loaded model: configuration, tokenizer and weight views. The GGUF file
/// is kept alive here because every quantized view borrows its mapping.
pub struct Model {
    config: Config,
    tokenizer: Tokenizer,
    weights: Weights,
    _gguf: GgufFile,
}

impl Model {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Fresh session state, primed with `<|im_start|>`.
    pub fn new_state(&self) -> Result<State> {
        let im_start = self
            .tokenizer
            .special_id("<|im_start|>")
            .context("Vocabulary has no '<|im_start|>' special token")?;
        Ok(State::new(&self.config, im_start))
    }

    /// One autoregressive step: consumes token `token` at `position` and
    /// leaves the next-token logits in `state`.
    pub fn forward(&self, state: &mut State, token: usize, position: usize) {
        let c = &self.config;
        let w = &self.weights;
        let kv_dim = c.kv_dim();
        let s = state;

        w.token_embedding.copy_to(token * c.dim, &mut s.x);

        for (l, layer) in w.layers.iter().enumerate() {
            rmsnorm(&mut s.xb, &s.x, &layer.rms_att, c.rms_norm_eps);

            matmul(&mut s.q, &layer.wq, &s.xb, c.dim, c.dim);
            matmul(&mut s.k, &layer.wk, &s.xb, kv_dim, c.dim);
            matmul(&mut s.v, &layer.wv, &s.xb, kv_dim, c.dim);
            if let Some(bias) = &layer.q_bias {
                add_in_place(&mut s.q, bias);
            }
            if let Some(bias) = &layer.k_bias {
                add_in_place(&mut s.k, bias);
            }
            if let Some(bias) = &layer.v_bias {
                add_in_place(&mut s.v, bias);
            }

            // Rotate queries for every head, keys for every KV head.
            for h in 0..c.n_heads {
                w.rope.apply(position, &mut s.q[h * c.head_size..(h + 1) * c.head_size]);
            }
            for h in 0..c.n_kv_heads {
                w.rope.apply(position, &mut s.k[h * c.head_size..(h + 1) * c.head_size]);
            }

            s.key_cache[l][position * kv_dim..(position + 1) * kv_dim].copy_from_slice(&s.k);
            s.value_cache[l][position * kv_dim..(position + 1) * kv_dim].copy_from_slice(&s.v);

            attention(
                c,
                position,
                &s.q,
                &s.key_cache[l],
                &s.value_cache[l],
                &mut s.att,
                &mut s.xb,
            );

            matmul(&mut s.xb2, &layer.wo, &s.xb, c.dim, c.dim);
            add_in_place(&mut s.x, &s.xb2);

            rmsnorm(&mut s.xb, &s.x, &layer.rms_ffn, c.rms_norm_eps);

            matmul(&mut s.hb, &layer.w_gate, &s.xb, c.hidden_dim, c.dim);
            matmul(&mut s.hb2, &layer.w_up, &s.xb, c.hidden_dim, c.dim);

            // SwiGLU: silu(gate) * up, where silu(v) = v * sigmoid(v)
            s.hb.iter_mut().for_each(|gate| *gate *= (1.0 + (-*gate).exp()).recip());
            mul_in_place(&mut s.hb, &s.hb2);

            matmul(&mut s.xb, &layer.w_down, &s.hb, c.dim, c.hidden_dim);
            add_in_place(&mut s.x, &s.xb);
        }

        rmsnorm_in_place(&mut s.x, &w.rms_final, c.rms_norm_eps);
        matmul(&mut s.logits, &w.wcls, &s.x, c.vocab_size, c.dim);
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer)
            .field("wcls_type", &self.weights.wcls.ggml_type())
            .finish_non_exhaustive()
    }
}

/// Causal attention for one step, parallel across heads. The caches hold
/// positions `0..=position` already; all reads happen after the serial
/// writes above, so heads only share read-only data.
fn attention(
    config: &Config,
    position: usize,
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    att: &mut [f32],
    xb: &mut [f32],
) {
    let head_size = config.head_size;
    let kv_dim = config.kv_dim();
    let kv_mul = config.kv_mul();
    let scale = (head_size as f32).sqrt().recip();

    att.par_chunks_mut(config.context_length)
        .zip(xb.par_chunks_mut(head_size))
        .zip((0..config.n_heads).into_par_iter())
        .for_each(|((att_head, xb_head), h)| {
            let q_head = &q[h * head_size..(h + 1) * head_size];
            let kv_head_offset = (h / kv_mul) * head_size;

            let att_head = &mut att_head[..=position];
            for (t, score) in att_head.iter_mut().enumerate() {
                let k_offset = t * kv_dim + kv_head_offset;
                *score = q_head
                    .iter()
                    .zip(&key_cache[k_offset..k_offset + head_size])
                    .map(|(&a, &b)| a * b)
                    .sum::<f32>()
                    * scale;
            }

            softmax(att_head);

            xb_head.fill(0.0);
            for (t, &weight) in att_head.iter().enumerate() {
                let v_offset = t * kv_dim + kv_head_offset;
                xb_head
                    .iter_mut()
                    .zip(&value_cache[v_offset..v_offset + head_size])
                    .for_each(|(out, &value)| *out += weight * value);
            }
        });
}

/// Builder for loading a model from a GGUF file.
pub struct ModelBuilder {
    model_path: PathBuf,
    context_length: Option<usize>,
}

impl ModelBuilder {
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self { model_path: model_path.as_ref().to_path_buf(), context_length: None }
    }

    /// Caps the context window (and with it the KV cache allocation) below
    /// what the model metadata declares.
    pub fn with_context_length(mut self, context_length: Option<usize>) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn build(self) -> Result<Model> {
        let started = Instant::now();
        let gguf = GgufFile::open(&self.model_path)?;
        log::debug!("{gguf:?}");

        let tokenizer = Tokenizer::from_gguf(&gguf)?;
        let config = Config::from_gguf(&gguf, tokenizer.vocab().size(), self.context_length)?;
        let weights = Weights::load(&gguf, &config)?;

        info!(
            "Loaded {} ({} layers, {} heads, context {}) in {:.2}s",
            self.model_path.display(),
            config.n_layers,
            config.n_heads,
            config.context_length,
            started.elapsed().as_secs_f64()
        );

        Ok(Model { config, tokenizer, weights, _gguf: gguf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 32,
            context_length: 16,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            head_size: 4,
        }
    }

    #[test]
    fn derived_dimensions() {
        let config = test_config();
        assert_eq!(config.kv_dim(), 4);
        assert_eq!(config.kv_mul(), 2);
    }

    #[test]
    fn state_buffers_match_config() {
        let config = test_config();
        let state = State::new(&config, 7);
        assert_eq!(state.latest_token, 7);
        assert_eq!(state.att.len(), config.n_heads * config.context_length);
        assert_eq!(state.key_cache.len(), config.n_layers);
        assert_eq!(state.key_cache[0].len(), config.context_length * config.kv_dim());
        assert_eq!(state.logits.len(), config.vocab_size);
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let rope = RopeTable::precompute(4, 8, 10_000.0);
        let original: Vec<f32> = (0..8).map(|i| i as f32 * 0.5 - 2.0).collect();
        let mut head = original.clone();
        rope.apply(0, &mut head);
        for (got, want) in head.iter().zip(original.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn rope_rotation_inverts() {
        let rope = RopeTable::precompute(8, 8, 10_000.0);
        let original: Vec<f32> = (0..8).map(|i| (i as f32 * 1.3).sin()).collect();
        let mut head = original.clone();
        let pos = 5;
        rope.apply(pos, &mut head);

        // Undo the rotation with the same table, conjugating the angle.
        let half = head.len() / 2;
        let (re, im) = head.split_at_mut(half);
        for (ic, (a, b)) in re.iter_mut().zip(im.iter_mut()).enumerate() {
            let (c, s) = (rope.cos[pos * half + ic], rope.sin[pos * half + ic]);
            let (a0, b0) = (*a, *b);
            *a = a0 * c + b0 * s;
            *b = b0 * c - a0 * s;
        }

        for (got, want) in re.iter().chain(im.iter()).zip(original.iter()) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn rope_frequencies_decay_across_the_head() {
        let rope = RopeTable::precompute(2, 8, 10_000.0);
        // At position 1 the first pair rotates by a full radian, later pairs
        // by progressively smaller angles.
        let base = rope.half_size;
        assert!((rope.cos[base] - 1f32.cos()).abs() < 1e-6);
        let mut previous_angle = f32::MAX;
        for ic in 0..rope.half_size {
            let angle = rope.sin[base + ic].atan2(rope.cos[base + ic]);
            assert!(angle < previous_angle);
            previous_angle = angle;
        }
    }
}
