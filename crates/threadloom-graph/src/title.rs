use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::graph::Graph;
use threadloom_core::traits::{ChatBackend, GraphStore};
use threadloom_core::types::{ChatMessage, ChatRequest, NodeKind};

const TITLE_SYSTEM_PROMPT: &str = "You name conversations. Reply with a title of at most six words. \
No quotes, no punctuation at the end, nothing else.";

const MAX_SOURCE_CHARS: usize = 600;
const MAX_TITLE_CHARS: usize = 80;

/// Which texts a title is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleStrategy {
    #[default]
    Prompts,
    Outputs,
}

/// Ask the backend for a short title describing `graph`.
pub async fn regenerate_title(
    backend: &dyn ChatBackend,
    store: &dyn GraphStore,
    graph: &Graph,
    strategy: TitleStrategy,
    model: &str,
) -> Result<String> {
    let mut sources = Vec::new();
    match strategy {
        TitleStrategy::Prompts => {
            for node in graph.nodes.iter().filter(|n| n.kind == NodeKind::Prompt) {
                if let Some(text) = node.text().filter(|t| !t.trim().is_empty()) {
                    sources.push(clip(text, MAX_SOURCE_CHARS));
                }
            }
        }
        TitleStrategy::Outputs => {
            for node in graph.nodes.iter().filter(|n| n.kind.is_generation()) {
                let outputs = store.outputs(&graph.id, &node.id).await?;
                if let Some(last) = outputs.iter().rev().find(|o| !o.text.trim().is_empty()) {
                    sources.push(clip(&last.text, MAX_SOURCE_CHARS));
                }
            }
        }
    }
    if sources.is_empty() {
        return Err(ThreadloomError::NotFound(format!(
            "no text to title graph {}",
            graph.id
        )));
    }

    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage::system(TITLE_SYSTEM_PROMPT),
            ChatMessage::user(sources.join("\n---\n")),
        ],
    };
    let mut stream = backend.chat_stream(request).await?;
    let mut raw = String::new();
    while let Some(chunk) = stream.next().await {
        raw.push_str(&chunk?);
    }

    let title = clean_title(&raw);
    if title.is_empty() {
        return Err(ThreadloomError::ProviderError("empty title".to_string()));
    }
    info!(graph_id = %graph.id, title = %title, "Title regenerated");
    Ok(title)
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn clean_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or_default();
    let line = line.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    let line = line.trim_end_matches(['.', '!']).trim();
    clip(line, MAX_TITLE_CHARS)
}
