//! End-to-end tests against a synthetic GGUF model.
//!
//! The fixture is a complete, byte-accurate GGUF file: metadata, a
//! byte-level vocabulary with the ChatML specials, and F32 weights from a
//! seeded generator. Small enough to run a real forward pass in tests.

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use qwen2_inference::chatml::{ChatMlFormat, Message, Role};
use qwen2_inference::generation::generate_tokens;
use qwen2_inference::sampler::Sampler;
use qwen2_inference::tokenizer::byte_to_unicode;
use qwen2_inference::transformer::{Model, ModelBuilder};
use std::io::Write as _;
use std::path::PathBuf;
use tempfile::TempDir;

const DIM: usize = 8;
const HIDDEN_DIM: usize = 16;
const N_LAYERS: usize = 2;
const N_HEADS: usize = 2;
const N_KV_HEADS: usize = 1;
const CONTEXT_LENGTH: usize = 32;
const VOCAB_SIZE: usize = 259; // 256 byte tokens + 3 ChatML specials
const KV_DIM: usize = DIM * N_KV_HEADS / N_HEADS;
const ALIGNMENT: usize = 32;

const EOT_ID: usize = 256;
const IM_START_ID: usize = 257;
const IM_END_ID: usize = 258;

fn next_random(state: &mut u64) -> f32 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    ((*state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
}

struct FixtureTensor {
    name: String,
    dims: Vec<u64>,
    values: Vec<f32>,
}

impl FixtureTensor {
    fn new(name: &str, dims: &[usize], rng: &mut u64, scale: f32, offset: f32) -> Self {
        let elements: usize = dims.iter().product();
        Self {
            name: name.to_string(),
            dims: dims.iter().map(|&d| d as u64).collect(),
            values: (0..elements).map(|_| next_random(rng) * scale + offset).collect(),
        }
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.write_u64::<LittleEndian>(s.len() as u64).unwrap();
    out.write_all(s.as_bytes()).unwrap();
}

fn put_u32_entry(out: &mut Vec<u8>, key: &str, value: u32) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(4).unwrap();
    out.write_u32::<LittleEndian>(value).unwrap();
}

fn put_f32_entry(out: &mut Vec<u8>, key: &str, value: f32) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(6).unwrap();
    out.write_f32::<LittleEndian>(value).unwrap();
}

fn put_string_entry(out: &mut Vec<u8>, key: &str, value: &str) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(8).unwrap();
    put_string(out, value);
}

fn put_string_array(out: &mut Vec<u8>, key: &str, values: &[String]) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(9).unwrap();
    out.write_u32::<LittleEndian>(8).unwrap();
    out.write_u64::<LittleEndian>(values.len() as u64).unwrap();
    for value in values {
        put_string(out, value);
    }
}

fn put_f32_array(out: &mut Vec<u8>, key: &str, values: &[f32]) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(9).unwrap();
    out.write_u32::<LittleEndian>(6).unwrap();
    out.write_u64::<LittleEndian>(values.len() as u64).unwrap();
    for &value in values {
        out.write_f32::<LittleEndian>(value).unwrap();
    }
}

fn put_i32_array(out: &mut Vec<u8>, key: &str, values: &[i32]) {
    put_string(out, key);
    out.write_u32::<LittleEndian>(9).unwrap();
    out.write_u32::<LittleEndian>(5).unwrap();
    out.write_u64::<LittleEndian>(values.len() as u64).unwrap();
    for &value in values {
        out.write_i32::<LittleEndian>(value).unwrap();
    }
}

fn fixture_tensors() -> Vec<FixtureTensor> {
    let mut rng = 0x5EED_u64;
    let mut tensors = Vec::new();

    tensors.push(FixtureTensor::new(
        "token_embd.weight",
        &[DIM, VOCAB_SIZE],
        &mut rng,
        0.6,
        0.0,
    ));
    for i in 0..N_LAYERS {
        let name = |suffix: &str| format!("blk.{i}.{suffix}");
        tensors.push(FixtureTensor::new(&name("attn_norm.weight"), &[DIM], &mut rng, 0.1, 1.0));
        tensors.push(FixtureTensor::new(&name("attn_q.weight"), &[DIM, DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_k.weight"), &[DIM, KV_DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_v.weight"), &[DIM, KV_DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_q.bias"), &[DIM], &mut rng, 0.1, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_k.bias"), &[KV_DIM], &mut rng, 0.1, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_v.bias"), &[KV_DIM], &mut rng, 0.1, 0.0));
        tensors.push(FixtureTensor::new(&name("attn_output.weight"), &[DIM, DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("ffn_norm.weight"), &[DIM], &mut rng, 0.1, 1.0));
        tensors.push(FixtureTensor::new(&name("ffn_gate.weight"), &[DIM, HIDDEN_DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("ffn_down.weight"), &[HIDDEN_DIM, DIM], &mut rng, 0.3, 0.0));
        tensors.push(FixtureTensor::new(&name("ffn_up.weight"), &[DIM, HIDDEN_DIM], &mut rng, 0.3, 0.0));
    }
    tensors.push(FixtureTensor::new("output_norm.weight", &[DIM], &mut rng, 0.1, 1.0));
    // No output.weight: the classifier reuses the token embedding.
    tensors
}

fn fixture_vocab() -> Vec<String> {
    let mut tokens: Vec<String> = (0..=255u8).map(|b| byte_to_unicode(b).to_string()).collect();
    tokens.push("<|endoftext|>".to_string());
    tokens.push("<|im_start|>".to_string());
    tokens.push("<|im_end|>".to_string());
    tokens
}

fn build_gguf_bytes(tokenizer_model: &str) -> Vec<u8> {
    let tensors = fixture_tensors();
    let tokens = fixture_vocab();
    let scores = vec![0.0f32; tokens.len()];
    let mut token_types = vec![1i32; 256];
    token_types.extend([3, 3, 3]);

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(0x46554747).unwrap();
    out.write_u32::<LittleEndian>(3).unwrap();
    out.write_u64::<LittleEndian>(tensors.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(13).unwrap();

    put_u32_entry(&mut out, "qwen2.embedding_length", DIM as u32);
    put_u32_entry(&mut out, "qwen2.feed_forward_length", HIDDEN_DIM as u32);
    put_u32_entry(&mut out, "qwen2.block_count", N_LAYERS as u32);
    put_u32_entry(&mut out, "qwen2.attention.head_count", N_HEADS as u32);
    put_u32_entry(&mut out, "qwen2.attention.head_count_kv", N_KV_HEADS as u32);
    put_u32_entry(&mut out, "qwen2.context_length", CONTEXT_LENGTH as u32);
    put_f32_entry(&mut out, "qwen2.attention.layer_norm_rms_epsilon", 1e-5);
    put_f32_entry(&mut out, "qwen2.rope.freq_base", 10_000.0);
    put_string_entry(&mut out, "tokenizer.ggml.model", tokenizer_model);
    put_string_array(&mut out, "tokenizer.ggml.tokens", &tokens);
    put_f32_array(&mut out, "tokenizer.ggml.scores", &scores);
    put_string_array(&mut out, "tokenizer.ggml.merges", &[]);
    put_i32_array(&mut out, "tokenizer.ggml.token_type", &token_types);

    // Descriptor section: offsets are relative to the aligned data region,
    // each tensor padded out to the alignment.
    let mut offset = 0u64;
    let mut offsets = Vec::new();
    for tensor in &tensors {
        offsets.push(offset);
        let size = (tensor.values.len() * 4) as u64;
        offset += size.next_multiple_of(ALIGNMENT as u64);
    }
    for (tensor, &tensor_offset) in tensors.iter().zip(&offsets) {
        put_string(&mut out, &tensor.name);
        out.write_u32::<LittleEndian>(tensor.dims.len() as u32).unwrap();
        for &dim in &tensor.dims {
            out.write_u64::<LittleEndian>(dim).unwrap();
        }
        out.write_u32::<LittleEndian>(0).unwrap(); // F32
        out.write_u64::<LittleEndian>(tensor_offset).unwrap();
    }

    while out.len() % ALIGNMENT != 0 {
        out.push(0);
    }
    for tensor in &tensors {
        for &value in &tensor.values {
            out.write_f32::<LittleEndian>(value).unwrap();
        }
        while out.len() % ALIGNMENT != 0 {
            out.push(0);
        }
    }
    out
}

fn write_fixture(dir: &TempDir, tokenizer_model: &str) -> PathBuf {
    let path = dir.path().join("tiny-qwen2.gguf");
    std::fs::write(&path, build_gguf_bytes(tokenizer_model)).unwrap();
    path
}

fn load_fixture(dir: &TempDir) -> Result<Model> {
    ModelBuilder::new(write_fixture(dir, "gpt2")).build()
}

#[test]
fn loads_config_and_vocabulary_from_metadata() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;

    let config = model.config();
    assert_eq!(config.dim, DIM);
    assert_eq!(config.hidden_dim, HIDDEN_DIM);
    assert_eq!(config.n_layers, N_LAYERS);
    assert_eq!(config.n_heads, N_HEADS);
    assert_eq!(config.n_kv_heads, N_KV_HEADS);
    assert_eq!(config.context_length, CONTEXT_LENGTH);
    assert_eq!(config.vocab_size, VOCAB_SIZE);
    assert_eq!(config.head_size, DIM / N_HEADS);

    let tokenizer = model.tokenizer();
    assert_eq!(tokenizer.vocab().size(), VOCAB_SIZE);
    assert_eq!(tokenizer.special_id("<|im_start|>"), Some(IM_START_ID));
    assert_eq!(tokenizer.special_id("<|im_end|>"), Some(IM_END_ID));
    assert_eq!(tokenizer.special_id("<|endoftext|>"), Some(EOT_ID));
    assert!(tokenizer.is_special(EOT_ID));
    assert!(!tokenizer.is_special(EOT_ID - 1));
    Ok(())
}

#[test]
fn rejects_non_gpt2_tokenizer_model() {
    let dir = TempDir::new().unwrap();
    let err = ModelBuilder::new(write_fixture(&dir, "llama"))
        .build()
        .unwrap_err()
        .to_string();
    assert!(err.contains("gpt2"), "{err}");
}

#[test]
fn context_length_can_be_capped_below_the_model_metadata() -> Result<()> {
    let dir = TempDir::new()?;
    let model = ModelBuilder::new(write_fixture(&dir, "gpt2"))
        .with_context_length(Some(16))
        .build()?;
    assert_eq!(model.config().context_length, 16);
    Ok(())
}

#[test]
fn new_state_is_primed_with_the_turn_start_token() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    assert_eq!(model.new_state()?.latest_token, IM_START_ID);
    Ok(())
}

#[test]
fn forward_produces_finite_logits_for_every_position() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let mut state = model.new_state()?;
    for position in 0..4 {
        model.forward(&mut state, position + 10, position);
        assert_eq!(state.logits().len(), VOCAB_SIZE);
        assert!(state.logits().iter().all(|v| v.is_finite()), "position {position}");
    }
    Ok(())
}

#[test]
fn loaded_vocabulary_round_trips_text() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let tokenizer = model.tokenizer();
    let text = "Hello, world!\n";
    assert_eq!(tokenizer.decode(&tokenizer.encode_ordinary(text)), text);
    Ok(())
}

#[test]
fn special_literal_encodes_to_its_single_id() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let ids = model.tokenizer().encode_with_specials("<|im_start|>");
    assert_eq!(ids, vec![IM_START_ID]);
    Ok(())
}

#[test]
fn chatml_turn_is_delimited_by_the_special_ids() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let format = ChatMlFormat::new(model.tokenizer())?;
    let tokens = format.encode_message(&Message::new(Role::User, "Hi"));
    assert_eq!(tokens.first(), Some(&IM_START_ID));
    assert_eq!(tokens.last(), Some(&IM_END_ID));
    Ok(())
}

fn greedy_run(model: &Model, prompt: &str, max_tokens: i64) -> Result<Vec<usize>> {
    let tokenizer = model.tokenizer();
    let format = ChatMlFormat::new(tokenizer)?;
    let mut state = model.new_state()?;
    let mut sampler = Sampler::new(model.config().vocab_size, 0.0, 0.95, 42);
    let prompt_tokens = tokenizer.encode_ordinary(prompt);
    assert!(!prompt_tokens.is_empty());
    Ok(generate_tokens(
        model,
        &mut state,
        0,
        &prompt_tokens,
        &format.stop_tokens(),
        max_tokens,
        &mut sampler,
        false,
        |_| {},
    ))
}

#[test]
fn greedy_generation_is_deterministic() -> Result<()> {
    // temperature 0, same prompt, fresh state both times: the sampled
    // token sequences must match exactly.
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;

    let first = greedy_run(&model, "1 2 3 4", 20)?;
    let second = greedy_run(&model, "1 2 3 4", 20)?;
    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert!(first.iter().all(|&token| token < VOCAB_SIZE));

    // A reproducible prefix: the first tokens of a greedy run are a stable
    // function of the fixture weights.
    let shorter = greedy_run(&model, "1 2 3 4", 15)?;
    let overlap = shorter.len().min(first.len()).min(8);
    assert_eq!(first[..overlap], shorter[..overlap]);
    Ok(())
}

#[test]
fn generation_respects_the_token_cap() -> Result<()> {
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let tokenizer = model.tokenizer();
    let prompt_tokens = tokenizer.encode_ordinary("1 2 3 4");
    let cap = prompt_tokens.len() as i64 + 3;

    let mut state = model.new_state()?;
    let mut sampler = Sampler::new(model.config().vocab_size, 0.0, 0.95, 1);
    let generated = generate_tokens(
        &model,
        &mut state,
        0,
        &prompt_tokens,
        &[],
        cap,
        &mut sampler,
        false,
        |_| {},
    );
    assert!(generated.len() <= 3);
    Ok(())
}

#[test]
fn chat_style_continuation_reuses_the_cache() -> Result<()> {
    // Two calls against one state, the second starting where the first
    // ended, must keep producing valid tokens: the cache rows written by
    // turn one stay in place for turn two.
    let dir = TempDir::new()?;
    let model = load_fixture(&dir)?;
    let tokenizer = model.tokenizer();
    let format = ChatMlFormat::new(tokenizer)?;
    let stop_tokens = format.stop_tokens();
    let mut sampler = Sampler::new(model.config().vocab_size, 0.0, 0.95, 7);
    let mut state = model.new_state()?;

    let mut conversation = format.encode_message(&Message::new(Role::User, "hi"));
    conversation.extend(format.encode_header(&Message::new(Role::Assistant, "")));

    let first = generate_tokens(
        &model, &mut state, 0, &conversation.clone(), &stop_tokens, 20, &mut sampler, false, |_| {},
    );
    conversation.extend(&first);
    let start_position = conversation.len();
    if start_position + 2 >= CONTEXT_LENGTH {
        return Ok(()); // fixture context exhausted in turn one
    }

    let pending = vec![conversation[start_position - 1]];
    let second = generate_tokens(
        &model,
        &mut state,
        start_position,
        &pending,
        &stop_tokens,
        (start_position + 2) as i64,
        &mut sampler,
        false,
        |_| {},
    );
    assert!(second.iter().all(|&token| token < VOCAB_SIZE));
    Ok(())
}
