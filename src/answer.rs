//! Answer synthesis: pack ranked results into a bounded context, ask the
//! chat model once, keep only citations that point at packed nodes.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::providers::{ChatClient, ChatMessage};
use crate::retrieval::ResultNode;

pub const SYSTEM_PROMPT: &str = "You answer questions about a software project using only the \
project memory provided. Each memory item starts with its id in square brackets. Cite every \
claim with the id of the item it came from, for example [3f2a...]. If the memory does not \
answer the question, say so plainly. Be concise.";

lazy_static! {
    static ref CITATION: Regex = Regex::new(r"\[([0-9A-Za-z][0-9A-Za-z:_\-]{7,})\]").unwrap();
    static ref SPACES: Regex = Regex::new(r"[ \t]{2,}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackedContext {
    pub text: String,
    pub included: Vec<String>,
    pub dropped: usize,
}

fn block(r: &ResultNode) -> String {
    let mut out = format!("[{}] ({}) {}\n", r.node_id, r.node_type, r.title);
    if !r.summary.is_empty() {
        out.push_str(&r.summary);
        out.push('\n');
    }
    if let Some(snippet) = r.snippet.as_deref().filter(|s| *s != r.summary) {
        out.push_str("> ");
        out.push_str(snippet);
        out.push('\n');
    }
    out
}

/// Greedy in rank order: a block that does not fit is skipped, later
/// smaller ones may still go in.
pub fn pack_context(results: &[ResultNode], budget_chars: usize) -> PackedContext {
    let mut text = String::new();
    let mut included = Vec::new();
    let mut dropped = 0;
    for r in results {
        let b = block(r);
        if text.chars().count() + b.chars().count() + 1 > budget_chars {
            dropped += 1;
            continue;
        }
        text.push_str(&b);
        text.push('\n');
        included.push(r.node_id.clone());
    }
    PackedContext {
        text,
        included,
        dropped,
    }
}

/// Remove citations of ids not in `known`; returns the cleaned text and the
/// surviving ids in order of first appearance.
pub fn strip_unknown_citations(text: &str, known: &HashSet<String>) -> (String, Vec<String>) {
    let mut cited = Vec::new();
    let cleaned = CITATION.replace_all(text, |caps: &regex::Captures<'_>| {
        let id = &caps[1];
        if known.contains(id) {
            if !cited.iter().any(|c: &String| c == id) {
                cited.push(id.to_string());
            }
            caps[0].to_string()
        } else {
            String::new()
        }
    });
    let cleaned = SPACES.replace_all(&cleaned, " ");
    let cleaned = cleaned.replace(" .", ".").replace(" ,", ",");
    (cleaned.trim().to_string(), cited)
}

/// One chat call. With `out`, tokens are written as they arrive.
pub fn synthesize(
    chat: &dyn ChatClient,
    query: &str,
    results: &[ResultNode],
    budget_chars: usize,
    out: Option<&mut dyn Write>,
    cancel: &CancelToken,
) -> Result<Answer> {
    let packed = pack_context(results, budget_chars);
    debug!(included = packed.included.len(), dropped = packed.dropped, "answer context packed");
    let messages = [
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Project memory:\n\n{}\nQuestion: {query}",
            packed.text
        )),
    ];

    let mut write_err: Option<std::io::Error> = None;
    let raw = match out {
        Some(w) => {
            let reply = chat.chat(
                &messages,
                &mut |token| {
                    if write_err.is_none() {
                        if let Err(e) = w.write_all(token.as_bytes()).and_then(|_| w.flush()) {
                            write_err = Some(e);
                        }
                    }
                },
                cancel,
            )?;
            if let Some(e) = write_err {
                return Err(e).context("Failed to stream answer");
            }
            reply
        }
        None => chat.chat(&messages, &mut |_| {}, cancel)?,
    };

    let known: HashSet<String> = packed.included.into_iter().collect();
    let (text, citations) = strip_unknown_citations(&raw, &known);
    Ok(Answer { text, citations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::model::NodeType;
    use crate::providers::fakes::ScriptedChat;
    use crate::retrieval::fusion::ResultSource;

    fn result(id: &str, title: &str, summary: &str) -> ResultNode {
        ResultNode {
            node_id: id.into(),
            node_type: NodeType::Decision,
            title: title.into(),
            summary: summary.into(),
            score: 1.0,
            source: ResultSource::Fts,
            snippet: None,
        }
    }

    #[test]
    fn unknown_citations_are_stripped() {
        let known: HashSet<String> = ["aaaaaaaa-1".to_string()].into();
        let (text, cites) =
            strip_unknown_citations("JWT is used [aaaaaaaa-1] [zzzzzzzz-9]. Done [aaaaaaaa-1].", &known);
        assert_eq!(text, "JWT is used [aaaaaaaa-1]. Done [aaaaaaaa-1].");
        assert_eq!(cites, vec!["aaaaaaaa-1"]);
    }

    #[test]
    fn pack_respects_budget() {
        let results = vec![
            result("id-000001", "Use JWT", &"x".repeat(200)),
            result("id-000002", "Use SQLite", "embedded"),
        ];
        let packed = pack_context(&results, 120);
        assert_eq!(packed.included, vec!["id-000002"]);
        assert_eq!(packed.dropped, 1);
    }

    #[test]
    fn streams_tokens_to_writer() {
        let chat = ScriptedChat::new("Tokens are stateless [id-000001] [id-999999]");
        let results = vec![result("id-000001", "Use JWT", "stateless")];
        let mut sink: Vec<u8> = Vec::new();
        let answer = synthesize(&chat, "why jwt", &results, 1000, Some(&mut sink), &CancelToken::new()).unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), "Tokens are stateless [id-000001] [id-999999]");
        assert_eq!(answer.text, "Tokens are stateless [id-000001]");
        assert_eq!(answer.citations, vec!["id-000001"]);
        let prompt = chat.last_prompt.lock().unwrap();
        assert!(prompt[1].content.contains("[id-000001] (decision) Use JWT"));
    }
}
