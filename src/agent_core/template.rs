//! Prompt templates: render a system prompt plus message history into one
//! prompt string for a completion model.
//!
//! Messages alternate user / assistant, starting with the user. When the
//! history ends on a user turn, the rendered prompt ends with an open
//! assistant turn for the model to complete.

use serde::Deserialize;

/// Renders conversation history into a single prompt.
pub trait Template: Send + Sync {
    fn render(&self, system_prompt: &str, messages: &[String]) -> String;

    /// Sequences that end the assistant's turn.
    fn stop_words(&self) -> Vec<String>;
}

/// Prompt formats commonly used by local instruction-tuned models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    #[default]
    ChatMl,
    Llama2,
    Alpaca,
    Vicuna,
}

fn is_user_turn(index: usize) -> bool {
    index % 2 == 0
}

fn ends_on_user_turn(messages: &[String]) -> bool {
    messages.len() % 2 == 1
}

impl TemplateFormat {
    fn render_chat_ml(system_prompt: &str, messages: &[String]) -> String {
        let mut out = String::new();
        if !system_prompt.is_empty() {
            out.push_str(&format!("<|im_start|>system\n{system_prompt}<|im_end|>\n"));
        }
        for (i, message) in messages.iter().enumerate() {
            let role = if is_user_turn(i) { "user" } else { "assistant" };
            out.push_str(&format!("<|im_start|>{role}\n{message}<|im_end|>\n"));
        }
        if ends_on_user_turn(messages) {
            out.push_str("<|im_start|>assistant\n");
        }
        out
    }

    fn render_llama2(system_prompt: &str, messages: &[String]) -> String {
        let mut out = String::new();
        for (i, message) in messages.iter().enumerate() {
            if is_user_turn(i) {
                out.push_str("<s>[INST] ");
                if i == 0 && !system_prompt.is_empty() {
                    out.push_str(&format!("<<SYS>>\n{system_prompt}\n<</SYS>>\n\n"));
                }
                out.push_str(message);
                out.push_str(" [/INST]");
            } else {
                out.push_str(&format!(" {message} </s>"));
            }
        }
        out
    }

    fn render_alpaca(system_prompt: &str, messages: &[String]) -> String {
        let mut out = String::new();
        if !system_prompt.is_empty() {
            out.push_str(&format!("{system_prompt}\n\n"));
        }
        for (i, message) in messages.iter().enumerate() {
            if is_user_turn(i) {
                out.push_str(&format!("### Instruction:\n{message}\n\n"));
            } else {
                out.push_str(&format!("### Response:\n{message}\n\n"));
            }
        }
        if ends_on_user_turn(messages) {
            out.push_str("### Response:\n");
        }
        out
    }

    fn render_vicuna(system_prompt: &str, messages: &[String]) -> String {
        let mut out = String::new();
        if !system_prompt.is_empty() {
            out.push_str(&format!("{system_prompt}\n\n"));
        }
        for (i, message) in messages.iter().enumerate() {
            if is_user_turn(i) {
                out.push_str(&format!("USER: {message}\n"));
            } else {
                out.push_str(&format!("ASSISTANT: {message}</s>\n"));
            }
        }
        if ends_on_user_turn(messages) {
            out.push_str("ASSISTANT:");
        }
        out
    }
}

impl Template for TemplateFormat {
    fn render(&self, system_prompt: &str, messages: &[String]) -> String {
        match self {
            TemplateFormat::ChatMl => Self::render_chat_ml(system_prompt, messages),
            TemplateFormat::Llama2 => Self::render_llama2(system_prompt, messages),
            TemplateFormat::Alpaca => Self::render_alpaca(system_prompt, messages),
            TemplateFormat::Vicuna => Self::render_vicuna(system_prompt, messages),
        }
    }

    fn stop_words(&self) -> Vec<String> {
        let words: &[&str] = match self {
            TemplateFormat::ChatMl => &["<|im_end|>"],
            TemplateFormat::Llama2 => &["</s>", "[INST]"],
            TemplateFormat::Alpaca => &["### Instruction:"],
            TemplateFormat::Vicuna => &["USER:", "</s>"],
        };
        words.iter().map(|w| w.to_string()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
