//! Prompt ingestion and token generation.
//!
//! The single generation loop serves both drivers: instruct runs one turn
//! over a fresh state, chat keeps state, conversation tokens and the start
//! position alive across turns so the KV cache never recomputes history.

use crate::chatml::{ChatMlFormat, Message, Role};
use crate::sampler::Sampler;
use crate::tokenizer::{replace_control_characters, Tokenizer};
use crate::transformer::{Model, State};
use anyhow::Result;
use log::{info, warn};
use std::io::{self, Write};
use std::time::Instant;

/// Generates tokens into and out of the given session state.
///
/// Positions run from `start_position` to the cap; while prompt tokens
/// remain they are forced into the model (no sampling, no callback), then
/// sampled tokens are appended and reported until a stop token, the token
/// cap or the end of the context window.
///
/// Returns the generated tokens only, including the stop token when one was
/// hit. With `echo`, every consumed token goes to stderr with control
/// characters escaped.
pub fn generate_tokens(
    model: &Model,
    state: &mut State,
    start_position: usize,
    prompt_tokens: &[usize],
    stop_tokens: &[usize],
    max_tokens: i64,
    sampler: &mut Sampler,
    echo: bool,
    mut on_token: impl FnMut(usize),
) -> Vec<usize> {
    let context_length = model.config().context_length;
    let cap = if max_tokens < 0 || max_tokens as usize > context_length {
        context_length
    } else {
        max_tokens as usize
    };

    let started = Instant::now();
    let mut generated = Vec::new();
    let mut token = state.latest_token;
    let mut prompt_index = 0;

    for position in start_position..cap {
        model.forward(state, token, position);
        let next = if prompt_index < prompt_tokens.len() {
            let forced = prompt_tokens[prompt_index];
            prompt_index += 1;
            if echo {
                echo_token(model.tokenizer(), forced);
            }
            forced
        } else {
            let sampled = sampler.sample(state.logits_mut());
            if echo {
                echo_token(model.tokenizer(), sampled);
            }
            generated.push(sampled);
            on_token(sampled);
            if stop_tokens.contains(&sampled) {
                break;
            }
            sampled
        };
        token = next;
        state.latest_token = next;
    }

    let total = prompt_index + generated.len();
    let elapsed = started.elapsed().as_secs_f64();
    if total > 0 && elapsed > 0.0 {
        info!("{:.2} tokens/s ({total})", total as f64 / elapsed);
    }
    generated
}

fn echo_token(tokenizer: &Tokenizer, token: usize) {
    eprint!("{}", replace_control_characters(&tokenizer.decode(&[token])));
}

/// Streams one generated token to stdout if its type is printable text
/// (type 1, normal) or a raw byte piece (type 6); specials and control
/// tokens stay silent.
fn stream_token(tokenizer: &Tokenizer, token: usize) {
    let token_type = tokenizer.token_type(token);
    if token_type == 1 || token_type == 6 {
        print!("{}", tokenizer.decode(&[token]));
        let _ = io::stdout().flush();
    }
}

/// Single-turn instruct mode: frame the prompt, generate one response.
pub fn run_instruct(
    model: &Model,
    sampler: &mut Sampler,
    prompt: &str,
    system_prompt: Option<&str>,
    max_tokens: i64,
    stream: bool,
    echo: bool,
) -> Result<()> {
    let tokenizer = model.tokenizer();
    let format = ChatMlFormat::new(tokenizer)?;

    let mut prompt_tokens = Vec::new();
    if let Some(system) = system_prompt {
        prompt_tokens.extend(format.encode_message(&Message::new(Role::System, system)));
    }
    prompt_tokens.extend(format.encode_message(&Message::new(Role::User, prompt)));
    prompt_tokens.extend(format.encode_header(&Message::new(Role::Assistant, "")));

    let mut state = model.new_state()?;
    let stop_tokens = format.stop_tokens();
    let mut response = generate_tokens(
        model,
        &mut state,
        0,
        &prompt_tokens,
        &stop_tokens,
        max_tokens,
        sampler,
        echo,
        |token| {
            if stream {
                stream_token(tokenizer, token);
            }
        },
    );

    if response.last().is_some_and(|last| stop_tokens.contains(last)) {
        response.pop();
    }
    if stream {
        println!();
    } else {
        println!("{}", tokenizer.decode(&response));
    }
    Ok(())
}

/// Interactive chat: a stdin loop over one shared session.
///
/// The conversation token list grows turn by turn; `start_position` marks
/// how far the model has already ingested, so each call to the generation
/// loop only feeds the new user turn. The stop token stays in the history
/// (the model saw it) but is stripped from what the user reads. Typing
/// `quit` or `exit` ends the session, as does running out of context.
pub fn run_chat(
    model: &Model,
    sampler: &mut Sampler,
    system_prompt: Option<&str>,
    max_tokens: i64,
    stream: bool,
    echo: bool,
) -> Result<()> {
    let tokenizer = model.tokenizer();
    let format = ChatMlFormat::new(tokenizer)?;
    let stop_tokens = format.stop_tokens();

    let mut conversation: Vec<usize> = Vec::new();
    if let Some(system) = system_prompt {
        conversation.extend(format.encode_message(&Message::new(Role::System, system)));
    }

    let stdin = io::stdin();
    let mut session: Option<State> = None;
    let mut start_position = 0;

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let user_text = line.trim();
        if user_text.is_empty() || user_text == "quit" || user_text == "exit" {
            break;
        }

        // State allocation can take a while for large context windows, so it
        // waits until the first message actually arrives.
        if session.is_none() {
            session = Some(model.new_state()?);
        }
        let state = session.as_mut().expect("session state allocated above");

        conversation.extend(format.encode_message(&Message::new(Role::User, user_text)));
        conversation.extend(format.encode_header(&Message::new(Role::Assistant, "")));

        let pending: Vec<usize> = conversation[start_position..].to_vec();
        let response = generate_tokens(
            model,
            state,
            start_position,
            &pending,
            &stop_tokens,
            max_tokens,
            sampler,
            echo,
            |token| {
                if stream {
                    stream_token(tokenizer, token);
                }
            },
        );

        conversation.extend(&response);
        start_position = conversation.len();

        let stopped = response.last().is_some_and(|last| stop_tokens.contains(last));
        let visible = if stopped { &response[..response.len() - 1] } else { &response[..] };
        if stream {
            println!();
        } else {
            println!("{}", tokenizer.decode(visible));
        }

        if !stopped {
            warn!("Ran out of context length...");
            break;
        }
    }
    Ok(())
}
