use crate::capabilities::model_family;
use crate::{ChatMessage, MessageRole};

const ASSISTANT_MARKER: &str = "<|assistant|>";

/// Chat prompt template for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|role|>` marker lines; used when no richer template applies
    Baseline,
    /// Qwen ChatML: `<|im_start|>role\ncontent<|im_end|>`
    ChatMl,
    /// Mistral Instruct: `<s>[INST] ... [/INST] response</s>`
    Mistral,
    /// Llama 2: `[INST] <<SYS>>\nsystem\n<</SYS>>\n\nuser [/INST]`
    Llama2,
    /// Llama 3 header blocks
    Llama3,
    /// Gemma turns: `<start_of_turn>user\ncontent<end_of_turn>`
    Gemma,
}

impl ChatTemplate {
    /// Choose the template for a model name.
    pub fn for_model(model_name: &str) -> Self {
        let lower = model_name.to_lowercase();
        if lower.contains("tinyllama") {
            return Self::Baseline;
        }
        match model_family(model_name) {
            "qwen" => Self::ChatMl,
            "mistral" => Self::Mistral,
            "gemma" => Self::Gemma,
            "llama" if lower.contains("llama-3") || lower.contains("llama3") => Self::Llama3,
            "llama" => Self::Llama2,
            _ => Self::Baseline,
        }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            Self::Baseline => format_baseline(messages),
            Self::ChatMl => format_chatml(messages),
            Self::Mistral => format_mistral(messages),
            Self::Llama2 => format_llama2(messages),
            Self::Llama3 => format_llama3(messages),
            Self::Gemma => format_gemma(messages),
        }
    }
}

/// Render `messages` into the prompt text for `model_name`.
///
/// If any message carries a role the model's chat template is used, and
/// unroled messages in that list are treated as user turns. Otherwise the
/// contents are joined with newlines as a plain completion prompt.
pub fn format_prompt(messages: &[ChatMessage], model_name: &str) -> String {
    if messages.iter().any(|m| m.role.is_some()) {
        ChatTemplate::for_model(model_name).render(messages)
    } else {
        format_plain(messages)
    }
}

fn role_of(message: &ChatMessage) -> &MessageRole {
    message.role.as_ref().unwrap_or(&MessageRole::User)
}

fn format_plain(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_baseline(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("<|{}|>\n{}\n", role_of(msg), msg.content));
    }

    // Only a bare marker line opens the assistant turn; marker text inside content does not
    let trimmed_len = out.trim_end().len();
    let body = &out[..trimmed_len];
    let open_turn = body == ASSISTANT_MARKER
        || body.ends_with(&format!("\n{}", ASSISTANT_MARKER));
    if open_turn {
        out.truncate(trimmed_len);
        out.push('\n');
    } else {
        out.push_str(ASSISTANT_MARKER);
        out.push('\n');
    }
    out
}

fn format_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            role_of(msg),
            msg.content
        ));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn format_mistral(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut in_inst = false;

    for msg in messages {
        match role_of(msg) {
            MessageRole::System => {
                if !in_inst {
                    out.push_str("<s>[INST] ");
                    in_inst = true;
                }
                out.push_str(&msg.content);
                out.push_str("\n\n");
            }
            MessageRole::Assistant => {
                if in_inst {
                    out.push_str(" [/INST]");
                    in_inst = false;
                }
                out.push(' ');
                out.push_str(&msg.content);
                out.push_str("</s>");
            }
            MessageRole::User | MessageRole::Other(_) => {
                if !in_inst {
                    out.push_str("<s>[INST] ");
                }
                out.push_str(&msg.content);
                out.push_str(" [/INST]");
                in_inst = false;
            }
        }
    }

    if in_inst {
        out.push_str(" [/INST]");
    }
    out
}

fn format_llama2(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut open = false;
    for msg in messages {
        match role_of(msg) {
            MessageRole::System => {
                if !open {
                    out.push_str("<s>[INST] ");
                    open = true;
                }
                out.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", msg.content));
            }
            MessageRole::Assistant => {
                out.push_str(&format!("{} </s>", msg.content));
                open = false;
            }
            MessageRole::User | MessageRole::Other(_) => {
                if !open {
                    out.push_str("<s>[INST] ");
                }
                out.push_str(&format!("{} [/INST] ", msg.content));
                open = false;
            }
        }
    }
    out
}

fn format_llama3(messages: &[ChatMessage]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for msg in messages {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            role_of(msg),
            msg.content
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

fn format_gemma(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut pending_system = String::new();
    for msg in messages {
        match role_of(msg) {
            MessageRole::System => {
                pending_system.push_str(&msg.content);
                pending_system.push_str("\n\n");
            }
            MessageRole::Assistant => {
                out.push_str(&format!("<start_of_turn>model\n{}<end_of_turn>\n", msg.content));
            }
            MessageRole::User | MessageRole::Other(_) => {
                out.push_str(&format!(
                    "<start_of_turn>user\n{}{}<end_of_turn>\n",
                    std::mem::take(&mut pending_system),
                    msg.content
                ));
            }
        }
    }
    if !pending_system.is_empty() {
        out.push_str(&format!(
            "<start_of_turn>user\n{}<end_of_turn>\n",
            pending_system.trim_end()
        ));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello!"),
        ]
    }

    #[test]
    fn test_baseline_renders_markers_in_order() {
        let formatted = format_baseline(&conversation());
        assert_eq!(
            formatted,
            "<|system|>\nYou are a helpful assistant.\n<|user|>\nHello!\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_baseline_appends_assistant_marker_once_after_assistant_turn() {
        let messages = vec![
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello there"),
        ];
        let formatted = format_baseline(&messages);

        assert!(formatted.ends_with("Hello there\n<|assistant|>\n"));
        assert!(!formatted.ends_with("<|assistant|>\n<|assistant|>\n"));
        assert_eq!(formatted.matches(ASSISTANT_MARKER).count(), 2);
    }

    #[test]
    fn test_baseline_does_not_double_an_open_assistant_turn() {
        let messages = vec![ChatMessage::user("Hi"), ChatMessage::assistant("")];
        let formatted = format_baseline(&messages);

        assert_eq!(formatted, "<|user|>\nHi\n<|assistant|>\n");
    }

    #[test]
    fn test_marker_text_inside_content_still_gets_assistant_line() {
        let messages = vec![ChatMessage::user("Reply after <|assistant|>")];
        let formatted = format_prompt(&messages, "unknown/model");
        assert_eq!(
            formatted,
            "<|user|>\nReply after <|assistant|>\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_baseline_renders_unknown_roles_with_generic_marker() {
        let messages = vec![
            ChatMessage::user("run it"),
            ChatMessage::new(MessageRole::parse("TOOL"), "exit 0"),
        ];
        let formatted = format_baseline(&messages);
        assert!(formatted.contains("<|tool|>\nexit 0\n"));
        assert!(formatted.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_plain_strategy_without_roles() {
        let messages = vec![
            ChatMessage::text("Once upon a time"),
            ChatMessage::text("there was"),
        ];
        let formatted = format_prompt(&messages, "TinyLlama/TinyLlama-1.1B-Chat-v1.0");
        assert_eq!(formatted, "Once upon a time\nthere was");
        assert!(!formatted.contains("<|"));
    }

    #[test]
    fn test_mixed_roles_use_chat_strategy() {
        let messages = vec![ChatMessage::system("Be terse."), ChatMessage::text("What is 2+2?")];
        let formatted = format_prompt(&messages, "unknown/model");
        assert_eq!(
            formatted,
            "<|system|>\nBe terse.\n<|user|>\nWhat is 2+2?\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_template_selection() {
        assert_eq!(ChatTemplate::for_model("Qwen/Qwen2.5-1.5B-Instruct-GGUF"), ChatTemplate::ChatMl);
        assert_eq!(ChatTemplate::for_model("mistralai/Mistral-7B-Instruct-v0.3"), ChatTemplate::Mistral);
        assert_eq!(ChatTemplate::for_model("google/gemma-3-4b-it-qat-q4_0-gguf"), ChatTemplate::Gemma);
        assert_eq!(ChatTemplate::for_model("meta-llama/Llama-3.2-1B-Instruct"), ChatTemplate::Llama3);
        assert_eq!(ChatTemplate::for_model("meta-llama/Llama-2-7b-chat-hf"), ChatTemplate::Llama2);
        assert_eq!(ChatTemplate::for_model("TinyLlama/TinyLlama-1.1B-Chat-v1.0"), ChatTemplate::Baseline);
        assert_eq!(ChatTemplate::for_model("microsoft/Phi-3-mini-4k-instruct"), ChatTemplate::Baseline);
        assert_eq!(ChatTemplate::for_model("unknown/model"), ChatTemplate::Baseline);
    }

    #[test]
    fn test_format_chatml_messages() {
        let formatted = format_chatml(&conversation());

        assert!(formatted.contains("<|im_start|>system\nYou are a helpful assistant.<|im_end|>"));
        assert!(formatted.contains("<|im_start|>user\nHello!<|im_end|>"));
        assert!(formatted.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_format_mistral_messages() {
        let formatted = format_mistral(&conversation());

        assert_eq!(formatted, "<s>[INST] You are a helpful assistant.\n\nHello! [/INST]");
    }

    #[test]
    fn test_format_mistral_multi_turn() {
        let messages = vec![
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello"),
            ChatMessage::user("Bye"),
        ];
        let formatted = format_mistral(&messages);
        assert_eq!(formatted, "<s>[INST] Hi [/INST] Hello</s><s>[INST] Bye [/INST]");
    }

    #[test]
    fn test_format_llama2_messages() {
        let formatted = format_llama2(&conversation());

        assert_eq!(
            formatted,
            "<s>[INST] <<SYS>>\nYou are a helpful assistant.\n<</SYS>>\n\nHello! [/INST] "
        );
    }

    #[test]
    fn test_format_llama3_messages() {
        let formatted = format_llama3(&conversation());

        assert!(formatted.starts_with("<|begin_of_text|><|start_header_id|>system<|end_header_id|>"));
        assert!(formatted.contains("<|start_header_id|>user<|end_header_id|>\n\nHello!<|eot_id|>"));
        assert!(formatted.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_format_gemma_folds_system_into_first_user_turn() {
        let formatted = format_gemma(&conversation());

        assert_eq!(
            formatted,
            "<start_of_turn>user\nYou are a helpful assistant.\n\nHello!<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn test_multi_turn_order_is_preserved() {
        let messages = vec![
            ChatMessage::system("You are a coding assistant."),
            ChatMessage::user("Write a hello world in Python."),
            ChatMessage::assistant("print('Hello, World!')"),
            ChatMessage::user("Now in Rust."),
        ];

        for template in [
            ChatTemplate::Baseline,
            ChatTemplate::ChatMl,
            ChatTemplate::Mistral,
            ChatTemplate::Llama2,
            ChatTemplate::Llama3,
            ChatTemplate::Gemma,
        ] {
            let formatted = template.render(&messages);
            let positions: Vec<usize> = messages
                .iter()
                .map(|m| formatted.find(&m.content).unwrap())
                .collect();
            assert!(
                positions.windows(2).all(|w| w[0] < w[1]),
                "{:?} reordered messages: {}",
                template,
                formatted
            );
        }
    }
}
