//! ragent 命令行演示
//!
//! 入口：初始化日志、加载配置、构建对话引擎，以流式方式运行命令行给出的任务，
//! 并把 Vercel 协议帧逐行打印到 stdout。Ctrl-C 会取消运行。
//!
//! 用法：`ragent [--config path/to/config.toml] <task...>`

use std::path::PathBuf;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use ragent::agent::{create_chat_engine, create_suggester, load_retriever, workflow_timeout};
use ragent::chat::{vercel_stream, StreamOptions};
use ragent::config::{load_config, AgentConfig};
use ragent::llm::create_llm_from_config;
use ragent::memory::Message;
use ragent::{observability, spawn_workflow};

const DEFAULT_TASK: &str = "Hello";

fn parse_args() -> (Option<PathBuf>, String) {
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next().map(PathBuf::from);
        } else {
            words.push(arg);
        }
    }
    let task = if words.is_empty() {
        DEFAULT_TASK.to_string()
    } else {
        words.join(" ")
    };
    (config_path, task)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let (config_path, task) = parse_args();
    let mut cfg = load_config(config_path).context("Failed to load config")?;
    if cfg.agents.is_empty() {
        tracing::info!("no agents configured, using a default assistant with the echo tool");
        cfg.agents.push(AgentConfig {
            tools: vec!["echo".to_string()],
            ..AgentConfig::default()
        });
    }

    let llm = create_llm_from_config(&cfg.llm);
    let retriever = load_retriever(&cfg.chat);
    let engine = create_chat_engine(&cfg, llm.clone(), retriever, Vec::new())
        .context("Error in chat engine")?;
    tracing::info!(engine = engine.kind(), task = %task, "running task");

    let handler = spawn_workflow(engine.into_workflow(), task.clone(), true, workflow_timeout(&cfg));
    let options = StreamOptions {
        history: vec![Message::user(task)],
        suggester: create_suggester(&cfg.chat, llm.clone()),
        ..StreamOptions::default()
    };
    let mut frames = vercel_stream(handler, options);

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            frame = frames.next() => match frame {
                Some(frame) => {
                    stdout.write_all(frame.as_bytes()).await.context("Failed to write frame")?;
                    stdout.flush().await.context("Failed to flush stdout")?;
                }
                None => break,
            },
        }
    }

    drop(frames);

    let (prompt, completion, total) = llm.token_usage();
    tracing::info!(prompt, completion, total, "token usage");
    Ok(())
}
