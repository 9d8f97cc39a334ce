//! 追问建议：回答结束后让 LLM 基于对话给出 3 个可能的下一个问题

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

pub const DEFAULT_NEXT_QUESTION_PROMPT: &str = "You're a helpful assistant! Your task is to suggest the next question that user might ask.
Here is the conversation history
---------------------
{conversation}
---------------------
Given the conversation history, please give me 3 questions that you might ask next!
Your answer should be wrapped in three sticks which follows the following format:
```
<question 1>
<question 2>
<question 3>
```";

const MAX_QUESTIONS: usize = 3;

#[derive(Clone)]
pub struct NextQuestionSuggester {
    llm: Arc<dyn LlmClient>,
    prompt: String,
}

impl NextQuestionSuggester {
    /// `prompt` 中的 `{conversation}` 会被替换为对话文本
    pub fn new(llm: Arc<dyn LlmClient>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            prompt: prompt.into(),
        }
    }

    pub fn with_default_prompt(llm: Arc<dyn LlmClient>) -> Self {
        Self::new(llm, DEFAULT_NEXT_QUESTION_PROMPT)
    }

    /// 失败或解析不到问题时返回 None，不影响主回答
    pub async fn suggest(&self, history: &[Message], response: &str) -> Option<Vec<String>> {
        let conversation = format_conversation(history, response);
        let prompt = self.prompt.replace("{conversation}", &conversation);
        match self.llm.complete(&prompt).await {
            Ok(text) => {
                let questions = parse_questions(&text);
                if questions.is_empty() {
                    tracing::debug!("no suggested questions in completion");
                    None
                } else {
                    Some(questions)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to suggest next questions");
                None
            }
        }
    }
}

/// 只取最后一个用户问题和本次回答
fn format_conversation(history: &[Message], response: &str) -> String {
    let last_user = history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    format!("User: {last_user}\nAssistant: {response}")
}

/// 解析三个反引号包裹的块，每行一个问题
pub fn parse_questions(text: &str) -> Vec<String> {
    let Some(start) = text.find("```") else {
        return Vec::new();
    };
    let body = &text[start + 3..];
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_QUESTIONS)
        .map(str::to_string)
        .collect()
}
