//! Prompt formatting
//!
//! Maps an abstract prompt onto the exact input each model family was
//! trained to expect. Three shapes exist: raw continuation, conversational
//! wrappers (system/user/assistant turns flattened to one string, with the
//! assistant turn pre-seeded by an opening code fence so the model emits
//! code first), and infill sentinels for fill-in-the-middle checkpoints.
//! Remote chat families render ordered role/content turns instead.
//!
//! Wrapper texts are behavioral: they are reproduced verbatim from the
//! reference catalog, trailing whitespace included.

use serde::{Deserialize, Serialize};

use crate::stop::StopMarkerSet;

/// One role/content turn for a remote chat API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// How a family shapes its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateMode {
    /// Prompt passed through as a raw continuation
    Raw,
    /// Multi-turn wrapper flattened into one string
    Conversational,
    /// Prefix/suffix/mask sentinel triple
    Infill,
    /// Ordered role/content turns for a remote API
    Chat,
}

/// Model-family template identifier.
///
/// A tagged variant plus per-family data replaces one subtype per model:
/// every family is fully described by its wrapper text, its extra stop
/// markers, and its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateFamily {
    /// No wrapper; the prompt is the input
    Completion,
    ChatMl,
    CodeLlama70bInstruct,
    CodeLlamaInstruct,
    Zyte,
    OpenChat,
    Solar,
    Alpaca,
    WhiteRabbitNeo,
    DeepSeekInstruct,
    Magicoder,
    AjibawaCode,
    XwinCoder,
    OpenCodeInterpreter,
    CodeGemma,
    Incoder,
    Codegen2,
    SantaCoder,
    StarCoder,
    /// Raw continuation with tab/space sentinel substitution (CodeT5+)
    CodeT5,
    OpenAiChat,
    MistralChat,
    AnthropicChat,
}

const OPENAI_TEXT_INSTRUCTION: &str = "Please generate code to complete the following problem:";
const OPENAI_JSON_INSTRUCTION: &str =
    r#"Please complete the following code snippet by generating JSON like {"code": ""}"#;
const MISTRAL_INSTRUCTION: &str =
    "Please generate code to solve the following problem in a Python markdown block:";
const ANTHROPIC_INSTRUCTION: &str =
    "Please generate code to complete the following problem wrapped in a Python markdown block:";

impl TemplateFamily {
    pub fn mode(&self) -> TemplateMode {
        use TemplateFamily::*;
        match self {
            Completion | CodeT5 => TemplateMode::Raw,
            Incoder | Codegen2 | SantaCoder | StarCoder => TemplateMode::Infill,
            OpenAiChat | MistralChat | AnthropicChat => TemplateMode::Chat,
            _ => TemplateMode::Conversational,
        }
    }

    /// Whether sessions on this family default to the conversational
    /// output budget
    pub fn is_conversational(&self) -> bool {
        matches!(
            self.mode(),
            TemplateMode::Conversational | TemplateMode::Chat
        )
    }

    /// Markers this family adds on top of the base end-of-sequence set
    pub fn extra_stop_markers(&self) -> &'static [&'static str] {
        use TemplateFamily::*;
        match self {
            ChatMl | CodeLlama70bInstruct | CodeLlamaInstruct | Zyte | OpenChat | Solar
            | Alpaca | WhiteRabbitNeo | DeepSeekInstruct | Magicoder | AjibawaCode | XwinCoder
            | CodeGemma => &["\n```"],
            OpenCodeInterpreter => &["<|EOT|>", "\n```\n", "\nif "],
            Incoder => &[
                "<|endofmask|>",
                "<|/ file",
                "</cell>",
                "</text>",
                "</code>",
                "<|",
                "</CODE>",
            ],
            Codegen2 => &["<eom>"],
            SantaCoder => &["<|endofmask|>"],
            AnthropicChat => &["\n```\n", "\nif "],
            Completion | StarCoder | CodeT5 | OpenAiChat | MistralChat => &[],
        }
    }

    /// Base marker set augmented with this family's additions
    pub fn stop_markers(&self) -> StopMarkerSet {
        StopMarkerSet::with_extra(self.extra_stop_markers().iter().copied())
    }

    /// Renders the model input for raw, conversational and infill families.
    ///
    /// Chat families render turns instead; see `chat_messages`.
    pub fn render(&self, prompt: &str) -> String {
        use TemplateFamily::*;
        match self {
            Completion => prompt.to_string(),
            CodeT5 => self.prepare(prompt),

            ChatMl => format!(
                "<|im_start|>system\nYou are an intelligent programming assistant to produce \
                 Python algorithmic solutions<|im_end|>\n<|im_start|>user\nCan you complete the \
                 following Python function?\n```python\n{prompt}\n```\n<|im_end|>\n\
                 <|im_start|>assistant\n```python\n"
            ),
            CodeLlama70bInstruct => format!(
                "'<s>Source: system\n\n You are a helpful and honest code assistant expert in \
                 Python. Please, provide all answers to programming questions in Python.\n <step> \
                 Source: user\n\n Provide a self-contained Python script that solves the \
                 following problem:\n```python\n{prompt}\n```\n <step> Source: assistant\n\n Here \
                 is a Python script that solves the problem:\n```python\n"
            ),
            CodeLlamaInstruct => format!(
                "[INST] Write code to solve the following coding problem that obeys the \
                 constraints and passes the example test cases. Please wrap your code answer \
                 using ```:\n```python\n{prompt}\n```\n[/INST]\n```python\n"
            ),
            Zyte => format!(
                "<|system|>You are an intelligent programming assistant to produce Python \
                 algorithmic solutions</s>\n<|user|>Can you complete the following Python \
                 function?\n```python\n{prompt}\n```\n</s>\n<|assistant|>\n```python\n"
            ),
            OpenChat => format!(
                "GPT4 Correct User: Can you complete the following Python function?\n```python\n\
                 {prompt}\n```\n<|end_of_turn|>GPT4 Correct Assistant:\n```python\n"
            ),
            Solar => format!(
                "<s> ### User:\nCan you solve and complete the Python function below?\n```python\n\
                 {prompt}\n```\n\n### Assistant:\nSure!\n```python\n"
            ),
            Alpaca => format!(
                "Below is an instruction that describes a task. Write a response that \
                 appropriately completes request.\n\n### Instruction:\nCreate a Python script \
                 for this problem:\n{prompt}\n\n### Response:\n```python\n"
            ),
            WhiteRabbitNeo => format!(
                "You code like a superhero!\nUSER:\nCreate a Python script to solve this \
                 problem:\n```python\n{prompt}\n```\nASSISTANT:\n```python\n"
            ),
            DeepSeekInstruct => format!(
                "You are an AI programming assistant, utilizing the DeepSeek Coder model, \
                 developed by DeepSeek Company, and you only answer questions related to computer \
                 science. For politically sensitive questions, security and privacy issues, and \
                 other non-computer science questions, you will refuse to answer.\n### \
                 Instruction:\nPlease complete the following Python function in a markdown style \
                 code block:\n```python\n{prompt}\n```\n### Response:\n```python\n"
            ),
            // Trailing indentation after the fence is part of the trained
            // distribution; keep it.
            Magicoder => format!(
                "You are an exceptionally intelligent coding assistant that consistently \
                 delivers accurate and reliable responses to user instructions.\n\n@@ \
                 Instruction\n{prompt}\n\n@@ Response\n```python\n        "
            ),
            AjibawaCode => format!(
                "This is a conversation with your helpful AI assistant. AI assistant can \
                 generate Python Code along with necessary explanation.\n\nContext\nYou are a \
                 helpful AI assistant.\n\nUSER:\n```python\n{prompt}\n```\nASSISTANT:\n```python\n"
            ),
            XwinCoder => format!(
                "<system>: You are an AI coding assistant that helps people with programming. \
                 Write a response that appropriately completes the user's request.\n<user>: \
                 Complete the following code for me and return a fully runable code.\n```python\n\
                 {prompt}\n```\n<AI>:\n```python\n"
            ),
            OpenCodeInterpreter => format!(
                "You are an exceptionally intelligent coding assistant that consistently \
                 delivers accurate and reliable responses to user instructions.\n\n@@ \
                 Instruction\nHere is a Python programming problem to solve:\n```python\n{prompt}\n\
                 ```\nPlease implement this function in a Python markdown code block starting \
                 with \"```python\" and follow the function/input/output formats.\n\n@@ Response\n"
            ),
            CodeGemma => format!("### Instruction\n{prompt}\n### Response\n"),

            Incoder => format!("{prompt}<|mask:0|><|mask:1|><|mask:0|>"),
            Codegen2 => format!("{prompt}<mask_1><|endoftext|><sep><mask_1>"),
            SantaCoder => format!("<fim-prefix>{prompt}<fim-suffix>\n<fim-middle>"),
            StarCoder => format!("<fim_prefix>{prompt}<fim_suffix><fim_middle>"),

            // Chat families have no flattened form; callers go through
            // chat_messages. Returning the prompt keeps the interface total.
            OpenAiChat | MistralChat | AnthropicChat => prompt.to_string(),
        }
    }

    /// Renders the ordered turns for a remote chat family.
    ///
    /// `json_object` selects the JSON-mode instruction on providers that
    /// support structured responses.
    pub fn chat_messages(&self, prompt: &str, json_object: bool) -> Vec<ChatMessage> {
        use TemplateFamily::*;
        let body = format!("\n```python\n{}\n```", prompt.trim());
        match self {
            OpenAiChat => {
                let instruction = if json_object {
                    OPENAI_JSON_INSTRUCTION
                } else {
                    OPENAI_TEXT_INSTRUCTION
                };
                vec![ChatMessage::user(format!("{instruction}{body}"))]
            }
            MistralChat => vec![ChatMessage::user(format!("{MISTRAL_INSTRUCTION}{body}"))],
            AnthropicChat => vec![ChatMessage::user(format!("{ANTHROPIC_INSTRUCTION}{body}\n"))],
            _ => vec![ChatMessage::user(self.render(prompt))],
        }
    }

    /// Whether this family substitutes indentation sentinels around the
    /// tokenizer
    pub fn substitutes_tabs(&self) -> bool {
        matches!(self, TemplateFamily::CodeT5)
    }

    /// Input-side whitespace substitution, applied before encoding
    pub fn prepare(&self, prompt: &str) -> String {
        if self.substitutes_tabs() {
            prompt.replace("    ", "\t")
        } else {
            prompt.to_string()
        }
    }

    /// Output-side inverse of `prepare`, applied after decoding
    pub fn restore(&self, output: &str) -> String {
        if self.substitutes_tabs() {
            output.replace('\t', "    ")
        } else {
            output.to_string()
        }
    }
}
