//! Realtime bidirectional audio channel with a structured event side-channel.
//!
//! Connects with a freshly issued ephemeral credential, streams microphone
//! PCM up as base64 append events, and surfaces the vendor's JSON events as
//! `ChannelEvent`s. Every event type the engine does not recognize
//! deserializes to `Unknown` and is ignored, so vendor-side additions never
//! break the session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message;
use tracing::{debug, trace, warn};

use crate::error::VoiceError;
use crate::remote::RealtimeCredential;

/// Structured events from the collaborator's side-channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscript { transcript: String },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.audio_transcript.done")]
    ReplyTranscript { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    ServiceError { error: ErrorDetail },
    /// Any event type this build does not know. Always a no-op.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub message: Option<String>,
}

/// What the reader task delivers to the session.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Event(ChannelEvent),
    /// The socket closed; `None` means a clean local close.
    Closed(Option<String>),
}

/// Parse one text frame. Unrecognized or malformed payloads become
/// `Unknown` rather than errors.
pub(crate) fn parse_event(text: &str) -> ChannelEvent {
    serde_json::from_str(text).unwrap_or(ChannelEvent::Unknown)
}

/// Decode a base64 PCM16 audio delta.
pub fn decode_audio_delta(delta: &str) -> Result<Vec<i16>, VoiceError> {
    let bytes = BASE64
        .decode(delta)
        .map_err(|e| VoiceError::Playback(format!("bad audio delta: {e}")))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub(crate) fn append_audio_message(pcm16: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm16.len() * 2);
    for sample in pcm16 {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(bytes),
    })
    .to_string()
}

/// Cloneable writing half of an open channel.
#[derive(Clone)]
pub struct RealtimeHandle {
    out_tx: mpsc::UnboundedSender<Message>,
}

impl RealtimeHandle {
    /// Stream one frame of microphone PCM up the channel.
    pub fn send_audio(&self, pcm16: &[i16]) -> Result<(), VoiceError> {
        self.out_tx
            .send(Message::Text(append_audio_message(pcm16)))
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Configure the server side: instructions, voice, server VAD.
    pub fn send_session_update(&self, instructions: &str, voice: &str) -> Result<(), VoiceError> {
        let update = json!({
            "type": "session.update",
            "session": {
                "instructions": instructions,
                "voice": voice,
                "turn_detection": { "type": "server_vad" },
                "input_audio_transcription": { "model": "whisper-1" },
            },
        });
        self.out_tx
            .send(Message::Text(update.to_string()))
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Initiate a clean close. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.out_tx.send(Message::Close(None));
    }
}

/// Connector for the realtime transport.
pub struct RealtimeChannel;

impl RealtimeChannel {
    /// Open the channel with a just-issued credential.
    ///
    /// # Errors
    ///
    /// `TransportSetup` when the handshake fails; everything after the
    /// handshake is reported through `ChannelSignal::Closed`.
    pub async fn connect(
        credential: &RealtimeCredential,
    ) -> Result<(RealtimeHandle, mpsc::UnboundedReceiver<ChannelSignal>), VoiceError> {
        let mut request = credential
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::TransportSetup(format!("bad channel url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.secret))
            .map_err(|e| VoiceError::TransportSetup(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| VoiceError::TransportSetup(format!("channel handshake failed: {e}")))?;
        debug!(url = %credential.url, "realtime channel open");
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<ChannelSignal>();
        tokio::spawn(async move {
            let mut close_reason = None;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let event = parse_event(&text);
                        if matches!(event, ChannelEvent::Unknown) {
                            trace!(frame = %text.chars().take(120).collect::<String>(),
                                "ignoring unknown channel event");
                            continue;
                        }
                        if signal_tx.send(ChannelSignal::Event(event)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        close_reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "channel read failed");
                        close_reason = Some(err.to_string());
                        break;
                    }
                }
            }
            let _ = signal_tx.send(ChannelSignal::Closed(close_reason));
        });

        Ok((RealtimeHandle { out_tx }, signal_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_events_parse_by_type_tag() {
        assert_eq!(
            parse_event(r#"{"type":"session.created","session":{"id":"s1"}}"#),
            ChannelEvent::SessionCreated
        );
        assert_eq!(
            parse_event(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":12}"#),
            ChannelEvent::SpeechStarted
        );
        assert_eq!(
            parse_event(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"bonjour"}"#
            ),
            ChannelEvent::UserTranscript {
                transcript: "bonjour".into()
            }
        );
        assert_eq!(parse_event(r#"{"type":"response.done"}"#), ChannelEvent::ResponseDone);
    }

    #[test]
    fn unknown_event_types_are_noops() {
        assert_eq!(
            parse_event(r#"{"type":"rate_limits.updated","rate_limits":[]}"#),
            ChannelEvent::Unknown
        );
        assert_eq!(
            parse_event(r#"{"type":"response.output_item.added"}"#),
            ChannelEvent::Unknown
        );
    }

    #[test]
    fn malformed_frames_are_noops() {
        assert_eq!(parse_event("not json"), ChannelEvent::Unknown);
        assert_eq!(parse_event("{}"), ChannelEvent::Unknown);
    }

    #[test]
    fn service_error_carries_the_message() {
        let event =
            parse_event(r#"{"type":"error","error":{"message":"session expired","code":"x"}}"#);
        assert_eq!(
            event,
            ChannelEvent::ServiceError {
                error: ErrorDetail {
                    message: Some("session expired".into())
                }
            }
        );
    }

    #[test]
    fn audio_delta_roundtrip() {
        let pcm: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let message = append_audio_message(&pcm);
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        let decoded = decode_audio_delta(value["audio"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn invalid_base64_delta_is_a_playback_error() {
        assert!(matches!(
            decode_audio_delta("!!!"),
            Err(VoiceError::Playback(_))
        ));
    }
}
