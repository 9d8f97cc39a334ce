//! 对话层：上下文对话引擎、追问建议与 Vercel 流式适配

pub mod context;
pub mod suggestion;
pub mod vercel;

pub use context::ContextChatEngine;
pub use suggestion::{parse_questions, NextQuestionSuggester, DEFAULT_NEXT_QUESTION_PROMPT};
pub use vercel::{
    agent_event_payload, data_frame, source_nodes, sources_payload, suggested_questions_payload,
    text_frame, vercel_stream, StreamOptions, VercelStream, DATA_PREFIX, TEXT_PREFIX,
};
