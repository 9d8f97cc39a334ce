//! 检索工具
//!
//! QueryEngine 是检索后端的抽象（向量库等不在本 crate 范围内）：`query(text, top_k, filters)`
//! 返回按分数排序的节点。QueryTool 把它包装成 Agent 可调用的工具，节点列表作为 raw_output
//! 进入本次运行的 sources。KeywordRetriever 是一个内存中的词重叠检索实现。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::schema::{input_schema, parse_args};
use crate::tools::{Tool, ToolContext, ToolResponse};

/// 检索工具的固定名称；引擎选择逻辑据此识别「只有检索工具」的 Agent
pub const QUERY_TOOL_NAME: &str = "QueryEngine";

const QUERY_TOOL_DESCRIPTION: &str = "Query the database";

/// 检索到的节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeWithScore {
    pub id: String,
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// 检索后端
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// 按相关性降序返回至多 top_k 个节点；filters 为 metadata 键值等值过滤
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<NodeWithScore>, String>;
}

/// 内存文档
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    tokens: HashSet<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            tokens: tokenize_lower(&text),
            text,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn matches(&self, filters: Option<&Value>) -> bool {
        let Some(Value::Object(filters)) = filters else {
            return true;
        };
        filters
            .iter()
            .all(|(k, v)| self.metadata.get(k).is_some_and(|m| m == v))
    }
}

/// 简单分词：按非字母数字切分、转小写、过滤单字符
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 词重叠检索：得分 = 查询与文档词重叠数 / sqrt(文档词数)
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    documents: Vec<Document>,
}

impl KeywordRetriever {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// 按 Markdown 二级标题（## ...）分块建库；无标题时整段视为一块
    pub fn from_markdown(source: &str, content: &str) -> Self {
        let content = content.trim();
        let documents = content
            .split("\n## ")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .enumerate()
            .map(|(i, block)| {
                Document::new(format!("{}#{}", source, i), block)
                    .with_metadata(serde_json::json!({ "file_name": source }))
            })
            .collect();
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn score(query: &HashSet<String>, doc: &Document) -> f64 {
        let overlap = query.intersection(&doc.tokens).count();
        if overlap == 0 {
            return 0.0;
        }
        overlap as f64 / (doc.tokens.len().max(1) as f64).sqrt()
    }
}

#[async_trait]
impl QueryEngine for KeywordRetriever {
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<NodeWithScore>, String> {
        let query = tokenize_lower(text);
        let mut scored: Vec<NodeWithScore> = self
            .documents
            .iter()
            .filter(|d| d.matches(filters))
            .map(|d| NodeWithScore {
                id: d.id.clone(),
                text: d.text.clone(),
                score: Self::score(&query, d),
                metadata: d.metadata.clone(),
            })
            .filter(|n| n.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryArgs {
    /// 检索问题（自然语言）
    pub input: String,
}

/// 检索工具：调用 QueryEngine，把节点文本拼成回答上下文
pub struct QueryTool {
    engine: Arc<dyn QueryEngine>,
    description: String,
    top_k: usize,
    filters: Option<Value>,
}

impl QueryTool {
    pub fn new(engine: Arc<dyn QueryEngine>, top_k: usize) -> Self {
        Self {
            engine,
            description: format!("{}\nThis is a preferred tool to use", QUERY_TOOL_DESCRIPTION),
            top_k,
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn engine(&self) -> Arc<dyn QueryEngine> {
        Arc::clone(&self.engine)
    }
}

/// 节点拼接为上下文文本
pub fn format_nodes(nodes: &[NodeWithScore]) -> String {
    nodes
        .iter()
        .map(|n| n.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        QUERY_TOOL_NAME
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<QueryArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResponse, String> {
        let args: QueryArgs = parse_args(self.name(), args)?;
        let nodes = self
            .engine
            .query(&args.input, self.top_k, self.filters.as_ref())
            .await?;
        let content = if nodes.is_empty() {
            "No relevant information found.".to_string()
        } else {
            format_nodes(&nodes)
        };
        let raw = serde_json::to_value(&nodes).map_err(|e| e.to_string())?;
        Ok(ToolResponse::with_raw(content, raw))
    }
}
