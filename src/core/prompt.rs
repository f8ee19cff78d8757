//! Prompt assembly with role-delimiter tags
//!
//! The layout follows the Phi-3 chat template: each block opens with a role
//! tag on its own line and closes with `<|end|>`. The prompt always ends with
//! an open assistant tag so the engine continues from there.

use crate::storage::{Role, Turn};

const END: &str = "<|end|>";
const SYSTEM_TAG: &str = "<|system|>";
const USER_TAG: &str = "<|user|>";
const ASSISTANT_TAG: &str = "<|assistant|>";

/// Stop sequence engines should honor so they do not write the next turn
pub const STOP_SEQUENCE: &str = END;

pub struct PromptBuilder;

impl PromptBuilder {
    /// Serialize the full history. Pure: same inputs, byte-identical output.
    pub fn build(system_prompt: &str, history: &[Turn]) -> String {
        let mut prompt = String::with_capacity(
            system_prompt.len() + history.iter().map(|t| t.content().len() + 24).sum::<usize>() + 48,
        );

        push_block(&mut prompt, SYSTEM_TAG, system_prompt);
        for turn in history {
            push_block(&mut prompt, role_tag(turn.role()), turn.content());
        }
        prompt.push_str(ASSISTANT_TAG);
        prompt.push('\n');

        prompt
    }

    /// Like [`PromptBuilder::build`], but drops the oldest turns until the
    /// prompt fits in `max_chars` characters. The newest turn is always kept
    /// and the window never starts with an assistant turn. `None` disables
    /// the limit.
    pub fn build_within(system_prompt: &str, history: &[Turn], max_chars: Option<usize>) -> String {
        let Some(max_chars) = max_chars else {
            return Self::build(system_prompt, history);
        };

        let fixed = block_chars(SYSTEM_TAG, system_prompt) + ASSISTANT_TAG.chars().count() + 1;
        let sizes: Vec<usize> = history
            .iter()
            .map(|t| block_chars(role_tag(t.role()), t.content()))
            .collect();
        let mut total = fixed + sizes.iter().sum::<usize>();

        let mut start = 0;
        while total > max_chars && start + 1 < history.len() {
            total -= sizes[start];
            start += 1;
        }
        while start + 1 < history.len() && history[start].role() == Role::Assistant {
            total -= sizes[start];
            start += 1;
        }

        if start > 0 {
            tracing::debug!(
                "[PromptBuilder] Dropped {} oldest turns to fit {} chars",
                start,
                max_chars
            );
        }
        if total > max_chars {
            tracing::warn!(
                "[PromptBuilder] Prompt is {} chars, over the {} char budget even after truncation",
                total,
                max_chars
            );
        }

        Self::build(system_prompt, &history[start..])
    }
}

fn role_tag(role: Role) -> &'static str {
    match role {
        Role::User => USER_TAG,
        Role::Assistant => ASSISTANT_TAG,
    }
}

fn push_block(prompt: &mut String, tag: &str, content: &str) {
    prompt.push_str(tag);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str(END);
    prompt.push('\n');
}

fn block_chars(tag: &str, content: &str) -> usize {
    tag.chars().count() + 1 + content.chars().count() + END.chars().count() + 1
}
