//! OpenAI-compatible transcription and chat-completion adapters.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{classify_http_failure, network_failure, ChatMessage, Completer, Transcriber};
use crate::error::{RemoteServiceKind, VoiceError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

fn build_client() -> Result<reqwest::Client, VoiceError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| VoiceError::remote(RemoteServiceKind::Network, e.to_string()))
}

/// Whisper-style `/audio/transcriptions` adapter.
pub struct OpenAiTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        language: Option<String>,
    ) -> Result<Self, VoiceError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language,
        })
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String, VoiceError> {
        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("clip.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::remote(RemoteServiceKind::Service, e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status.as_u16(), &body));
        }
        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::remote(RemoteServiceKind::Service, e.to_string()))?;
        debug!(chars = parsed.text.len(), "transcription received");
        Ok(parsed.text)
    }
}

/// `/chat/completions` adapter; plain or SSE-streamed per configuration.
pub struct OpenAiCompleter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    stream: bool,
}

impl OpenAiCompleter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        stream: bool,
    ) -> Result<Self, VoiceError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            stream,
        })
    }

    async fn complete_plain(&self, response: reqwest::Response) -> Result<String, VoiceError> {
        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: Option<String>,
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::remote(RemoteServiceKind::Service, e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                VoiceError::remote(RemoteServiceKind::Service, "completion had no choices")
            })
    }

    /// Accumulate an SSE stream into the full reply; stream completion is
    /// the reply-ready event.
    async fn complete_streamed(&self, response: reqwest::Response) -> Result<String, VoiceError> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| network_failure(&e))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                match parse_stream_line(line.trim()) {
                    StreamItem::Delta(delta) => reply.push_str(&delta),
                    StreamItem::Done => return Ok(reply),
                    StreamItem::Skip => {}
                }
            }
        }
        Ok(reply)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamItem {
    Delta(String),
    Done,
    Skip,
}

/// Parse one SSE line from a streamed completion.
pub(crate) fn parse_stream_line(line: &str) -> StreamItem {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamItem::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return StreamItem::Done;
    }
    #[derive(Deserialize)]
    struct StreamChunk {
        choices: Vec<StreamChoice>,
    }
    #[derive(Deserialize)]
    struct StreamChoice {
        delta: StreamDelta,
    }
    #[derive(Deserialize)]
    struct StreamDelta {
        content: Option<String>,
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .map_or(StreamItem::Skip, StreamItem::Delta),
        Err(_) => StreamItem::Skip,
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VoiceError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if self.stream {
            body["stream"] = json!(true);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status.as_u16(), &body));
        }
        if self.stream {
            self.complete_streamed(response).await
        } else {
            self.complete_plain(response).await
        }
    }
}
