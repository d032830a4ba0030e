//! Ollama adapters: `/api/embed` for vectors, `/api/chat` (NDJSON stream) for
//! answers, and a prompted `/api/generate` call for rerank scores.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use super::http::HttpClient;
use super::retry::RetryPolicy;
use super::{ChatClient, ChatMessage, EmbedRole, Embedder, Reranker};
use crate::cancel::CancelToken;
use crate::error::{ExternalClass, MemoryError};

fn protocol(service: &'static str, msg: impl Into<String>) -> anyhow::Error {
    MemoryError::external(service, ExternalClass::Protocol, msg).into()
}

fn encode(service: &'static str, value: &serde_json::Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| protocol(service, e.to_string()))
}

// ── Embeddings ──────────────────────────────────────────────────────────────

pub struct OllamaEmbedder {
    http: HttpClient,
    model: String,
    retry: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(host: &str, model: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("embedder", host, timeout)?,
            model: model.to_string(),
            retry,
        })
    }
}

/// nomic-style task prefixes keep queries and documents in matching spaces.
fn role_prefix(role: EmbedRole) -> &'static str {
    match role {
        EmbedRole::Document => "search_document: ",
        EmbedRole::Query => "search_query: ",
    }
}

impl Embedder for OllamaEmbedder {
    fn model_tag(&self) -> String {
        format!("ollama:{}", self.model)
    }

    fn embed_batch(&self, texts: &[String], role: EmbedRole, cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input: Vec<String> = texts
            .iter()
            .map(|t| format!("{}{t}", role_prefix(role)))
            .collect();
        let body = encode(
            "embedder",
            &serde_json::json!({ "model": self.model, "input": input }),
        )?;
        let raw = self
            .retry
            .run(cancel, "ollama embed", |_| self.http.post_json("/api/embed", &body))?;
        parse_embeddings(&raw.body, texts.len())
    }
}

fn parse_embeddings(json: &str, expected: usize) -> Result<Vec<Vec<f32>>> {
    #[derive(Deserialize)]
    struct EmbedResp {
        embeddings: Vec<Vec<f32>>,
    }
    let resp: EmbedResp = serde_json::from_str(json)
        .map_err(|e| protocol("embedder", format!("bad /api/embed payload: {e}")))?;
    if resp.embeddings.len() != expected {
        return Err(protocol(
            "embedder",
            format!("expected {expected} vectors, got {}", resp.embeddings.len()),
        ));
    }
    let dim = resp.embeddings.first().map(Vec::len).unwrap_or(0);
    if dim == 0 || resp.embeddings.iter().any(|v| v.len() != dim) {
        return Err(protocol("embedder", "vectors have inconsistent dimensions"));
    }
    Ok(resp.embeddings)
}

// ── Chat ────────────────────────────────────────────────────────────────────

pub struct OllamaChat {
    http: HttpClient,
    model: String,
    retry: RetryPolicy,
}

impl OllamaChat {
    pub fn new(host: &str, model: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("llm", host, timeout)?,
            model: model.to_string(),
            retry,
        })
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl ChatClient for OllamaChat {
    fn chat(&self, messages: &[ChatMessage], on_token: &mut dyn FnMut(&str), cancel: &CancelToken) -> Result<String> {
        let body = encode(
            "llm",
            &serde_json::json!({ "model": self.model, "messages": messages, "stream": true }),
        )?;
        // only retry while nothing has been streamed to the caller yet
        let mut emitted = false;
        self.retry.run(cancel, "ollama chat", |_| {
            if emitted {
                return Err(protocol("llm", "stream interrupted after partial output"));
            }
            let mut reply = String::new();
            self.http.post_lines("/api/chat", &body, cancel, |line| {
                let chunk: ChatChunk = serde_json::from_str(line)
                    .map_err(|e| protocol("llm", format!("bad stream line: {e}")))?;
                if let Some(err) = chunk.error {
                    return Err(MemoryError::external("llm", ExternalClass::Server, err).into());
                }
                if let Some(msg) = chunk.message {
                    if !msg.content.is_empty() {
                        emitted = true;
                        on_token(&msg.content);
                        reply.push_str(&msg.content);
                    }
                }
                Ok(())
            })?;
            Ok(reply)
        })
    }
}

// ── Rerank ──────────────────────────────────────────────────────────────────

pub struct OllamaReranker {
    http: HttpClient,
    model: String,
    retry: RetryPolicy,
}

impl OllamaReranker {
    pub fn new(host: &str, model: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new("reranker", host, timeout)?,
            model: model.to_string(),
            retry,
        })
    }
}

fn build_rerank_prompt(query: &str, docs: &[String]) -> String {
    let list = docs
        .iter()
        .enumerate()
        .map(|(i, d)| format!("{i}. {}", d.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are a relevance ranker for project knowledge.\n\
         Query: {query}\n\
         Documents:\n{list}\n\n\
         Score each document 0.0-1.0 for how well it answers the query.\n\
         Respond ONLY with valid JSON: {{\"scores\": [0.8, 0.3, ...]}} in document order."
    )
}

fn parse_rerank_scores(json: &str, expected: usize) -> Result<Vec<f32>> {
    #[derive(Deserialize)]
    struct ScoreResp {
        scores: Vec<f32>,
    }
    let resp: ScoreResp = serde_json::from_str(json)
        .map_err(|e| protocol("reranker", format!("bad score payload: {e}")))?;
    if resp.scores.len() != expected {
        return Err(protocol(
            "reranker",
            format!("expected {expected} scores, got {}", resp.scores.len()),
        ));
    }
    Ok(resp.scores.iter().map(|s| s.clamp(0.0, 1.0)).collect())
}

impl Reranker for OllamaReranker {
    fn rerank(&self, query: &str, docs: &[String], cancel: &CancelToken) -> Result<Vec<f32>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let body = encode(
            "reranker",
            &serde_json::json!({
                "model": self.model,
                "prompt": build_rerank_prompt(query, docs),
                "stream": false,
                "format": "json",
            }),
        )?;
        let raw = self
            .retry
            .run(cancel, "ollama rerank", |_| self.http.post_json("/api/generate", &body))?;

        #[derive(Deserialize)]
        struct GenerateResp {
            response: Option<String>,
        }
        let outer: GenerateResp = serde_json::from_str(&raw.body)
            .map_err(|e| protocol("reranker", format!("bad /api/generate payload: {e}")))?;
        let inner = outer
            .response
            .ok_or_else(|| protocol("reranker", "missing response field"))?;
        parse_rerank_scores(&inner, docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::domain_error;
    use crate::providers::http::testserver::{chunked_response, json_response, serve};

    fn fast() -> RetryPolicy {
        RetryPolicy::immediate(3)
    }

    #[test]
    fn rerank_scores_are_clamped_and_counted() {
        assert_eq!(
            parse_rerank_scores(r#"{"scores": [1.5, -0.3, 0.5]}"#, 3).unwrap(),
            vec![1.0, 0.0, 0.5]
        );
        assert!(parse_rerank_scores(r#"{"scores": [0.9]}"#, 3).is_err());
    }

    #[test]
    fn embed_uses_role_prefix_and_checks_count() {
        let (url, rx) = serve(vec![json_response(200, r#"{"embeddings": [[0.1, 0.2], [0.3, 0.4]]}"#)]);
        let e = OllamaEmbedder::new(&url, "nomic-embed-text", Duration::from_secs(2), fast()).unwrap();
        let out = e
            .embed_batch(&["a".into(), "b".into()], EmbedRole::Query, &CancelToken::new())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(rx.recv().unwrap().contains("search_query: a"));
        assert_eq!(e.model_tag(), "ollama:nomic-embed-text");
    }

    #[test]
    fn embed_retries_server_errors() {
        let (url, _rx) = serve(vec![
            json_response(503, "busy"),
            json_response(200, r#"{"embeddings": [[1.0]]}"#),
        ]);
        let e = OllamaEmbedder::new(&url, "m", Duration::from_secs(2), fast()).unwrap();
        let out = e.embed_batch(&["x".into()], EmbedRole::Document, &CancelToken::new()).unwrap();
        assert_eq!(out, vec![vec![1.0]]);
    }

    #[test]
    fn chat_streams_tokens_in_order() {
        let (url, _rx) = serve(vec![chunked_response(&[
            r#"{"message":{"role":"assistant","content":"Use "},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"JWT"},"done":false}"#,
            r#"{"done":true}"#,
        ])]);
        let chat = OllamaChat::new(&url, "llama3.2", Duration::from_secs(2), fast()).unwrap();
        let mut seen = Vec::new();
        let reply = chat
            .chat(&[ChatMessage::user("hi")], &mut |t| seen.push(t.to_string()), &CancelToken::new())
            .unwrap();
        assert_eq!(reply, "Use JWT");
        assert_eq!(seen, vec!["Use ", "JWT"]);
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let (url, _rx) = serve(vec![json_response(200, "not json")]);
        let r = OllamaReranker::new(&url, "m", Duration::from_secs(2), fast()).unwrap();
        let err = r.rerank("q", &["d".into()], &CancelToken::new()).unwrap_err();
        assert!(matches!(
            domain_error(&err),
            Some(MemoryError::External { class: ExternalClass::Protocol, .. })
        ));
    }
}
