//! Live channel: the bidirectional streaming session with the conversational model.
//!
//! Wire format is the Gemini Live JSON protocol. Client messages are built with the
//! helpers below; server frames are parsed into [`LiveEvent`]s by
//! [`parse_server_message`]. The WebSocket itself is split into a writer task draining
//! an outgoing queue and a reader task forwarding parsed events.

use crate::error::{VoiceError, VoiceResult};
use audit_core::tool_call::function_declarations;
use audit_core::{ToolAck, ToolInvocation};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One inbound event from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    SetupComplete,
    /// Base64 PCM16 model audio.
    Audio(String),
    /// Partial transcription of the user's speech.
    InputTranscript(String),
    /// Partial transcription of the model's speech.
    OutputTranscript(String),
    TurnComplete,
    /// The user barged in; queued model audio must stop.
    Interrupted,
    ToolCalls(Vec<ToolInvocation>),
    /// The server is about to end the session.
    GoAway,
    Closed,
}

/// Session settings sent in the `setup` message.
#[derive(Debug, Clone)]
pub struct LiveSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice: Option<String>,
}

pub fn setup_message(setup: &LiveSetup) -> Value {
    let mut generation = json!({ "responseModalities": ["AUDIO"] });
    if let Some(voice) = &setup.voice {
        generation["speechConfig"] = json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        });
    }
    json!({
        "setup": {
            "model": setup.model,
            "generationConfig": generation,
            "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
            "tools": [{ "functionDeclarations": function_declarations() }],
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    })
}

pub fn audio_message(pcm16_base64: &str, sample_rate: u32) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={sample_rate}"),
                "data": pcm16_base64
            }]
        }
    })
}

/// Synthetic text event (START, RESUME, SILENCE) injected as a user turn.
pub fn text_message(text: &str) -> Value {
    json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": true
        }
    })
}

pub fn tool_response_message(acks: &[ToolAck]) -> Value {
    let responses: Vec<Value> = acks
        .iter()
        .map(|ack| {
            json!({
                "id": ack.id,
                "name": ack.name,
                "response": { "result": ack.result }
            })
        })
        .collect();
    json!({ "toolResponse": { "functionResponses": responses } })
}

/// Parse one server frame. Unknown fields are ignored; a frame may carry several events.
pub fn parse_server_message(raw: &str) -> VoiceResult<Vec<LiveEvent>> {
    let v: Value = serde_json::from_str(raw)?;
    let mut events = Vec::new();

    if v.get("setupComplete").is_some() {
        events.push(LiveEvent::SetupComplete);
    }

    if let Some(content) = v.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                    events.push(LiveEvent::Audio(data.to_string()));
                }
            }
        }
        if let Some(text) = content.pointer("/inputTranscription/text").and_then(Value::as_str) {
            events.push(LiveEvent::InputTranscript(text.to_string()));
        }
        if let Some(text) = content.pointer("/outputTranscription/text").and_then(Value::as_str) {
            events.push(LiveEvent::OutputTranscript(text.to_string()));
        }
        if content.get("interrupted").and_then(Value::as_bool).unwrap_or(false) {
            events.push(LiveEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(Value::as_bool).unwrap_or(false) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(calls) = v.pointer("/toolCall/functionCalls").and_then(Value::as_array) {
        let mut invocations = Vec::with_capacity(calls.len());
        for call in calls {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| VoiceError::Protocol("function call without name".to_string()))?;
            invocations.push(ToolInvocation {
                id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or(Value::Null),
            });
        }
        events.push(LiveEvent::ToolCalls(invocations));
    }

    if v.get("goAway").is_some() {
        events.push(LiveEvent::GoAway);
    }

    Ok(events)
}

/// Sending half of the live session. Cloning shares the same socket.
#[derive(Clone)]
pub struct LiveChannel {
    outgoing: mpsc::UnboundedSender<Value>,
    shutdown: CancellationToken,
}

impl LiveChannel {
    /// Channel not bound to a socket; outgoing messages land in the returned receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn send(&self, message: Value) -> VoiceResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(VoiceError::ChannelClosed);
        }
        self.outgoing.send(message).map_err(|_| VoiceError::ChannelClosed)
    }

    pub fn send_text(&self, text: &str) -> VoiceResult<()> {
        debug!(text, "-> system event");
        self.send(text_message(text))
    }

    pub fn send_tool_responses(&self, acks: &[ToolAck]) -> VoiceResult<()> {
        self.send(tool_response_message(acks))
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outgoing.is_closed()
    }

    /// Stop both socket tasks. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Tasks driving a connected socket.
pub struct LiveConnection {
    pub channel: LiveChannel,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LiveConnection {
    /// Wait for both socket tasks after [`LiveChannel::close`].
    pub async fn join(self) {
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

/// Open the WebSocket, send `setup`, and forward parsed server events through `events`
/// (wrapped by `wrap`). A final [`LiveEvent::Closed`] is always delivered.
pub async fn connect<T, F>(
    url: &str,
    api_key: Option<&str>,
    setup: &LiveSetup,
    events: mpsc::UnboundedSender<T>,
    wrap: F,
) -> VoiceResult<LiveConnection>
where
    T: Send + 'static,
    F: Fn(LiveEvent) -> T + Send + 'static,
{
    let endpoint = match api_key {
        Some(key) => format!("{url}?key={key}"),
        None => url.to_string(),
    };
    let (socket, _) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
    info!("🔌 Live channel connected");
    let (mut sink, mut stream) = socket.split();

    let (channel, mut outgoing) = LiveChannel::detached();
    channel.send(setup_message(setup))?;

    let shutdown = channel.shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = outgoing.recv() => match next {
                    Some(message) => {
                        if let Err(e) = sink.send(Message::text(message.to_string())).await {
                            warn!("Live channel send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        debug!("live writer ended");
    });

    let shutdown = channel.shutdown.clone();
    let reader = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = stream.next() => frame,
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Live channel closed by server");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Live channel read failed: {}", e);
                    break;
                }
                None => break,
            };
            match parse_server_message(&text) {
                Ok(parsed) => {
                    for event in parsed {
                        if events.send(wrap(event)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Unparsable live frame: {}", e),
            }
        }
        shutdown.cancel();
        let _ = events.send(wrap(LiveEvent::Closed));
    });

    Ok(LiveConnection { channel, reader, writer })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_audio_transcripts_and_turn_complete_in_order() {
        let raw = r#"{"serverContent": {
            "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}, {"text": "ignored"}]},
            "outputTranscription": {"text": "Bonjour"},
            "turnComplete": true
        }}"#;
        assert_eq!(
            parse_server_message(raw).unwrap(),
            vec![
                LiveEvent::Audio("AAA=".into()),
                LiveEvent::OutputTranscript("Bonjour".into()),
                LiveEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn parses_tool_calls() {
        let raw = r#"{"toolCall": {"functionCalls": [
            {"id": "fc-1", "name": "record_answer", "args": {"questionId": "email", "value": "a@b.fr"}},
            {"id": "fc-2", "name": "technical_closure"}
        ]}}"#;
        let events = parse_server_message(raw).unwrap();
        let LiveEvent::ToolCalls(calls) = &events[0] else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args["questionId"], "email");
        assert_eq!(calls[1].args, Value::Null);
    }

    #[test]
    fn setup_and_interrupt_and_unknown_frames() {
        assert_eq!(parse_server_message(r#"{"setupComplete": {}}"#).unwrap(), vec![LiveEvent::SetupComplete]);
        assert_eq!(
            parse_server_message(r#"{"serverContent": {"interrupted": true}}"#).unwrap(),
            vec![LiveEvent::Interrupted]
        );
        assert!(parse_server_message(r#"{"usageMetadata": {}}"#).unwrap().is_empty());
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn tool_response_echoes_id_and_name() {
        let msg = tool_response_message(&[ToolAck {
            id: "fc-1".into(),
            name: "record_answer".into(),
            result: "recorded".into(),
        }]);
        assert_eq!(
            msg,
            json!({"toolResponse": {"functionResponses": [
                {"id": "fc-1", "name": "record_answer", "response": {"result": "recorded"}}
            ]}})
        );
    }

    #[test]
    fn setup_declares_tools_and_transcription() {
        let msg = setup_message(&LiveSetup {
            model: "models/live".into(),
            system_instruction: "Sois bref.".into(),
            voice: Some("Aoede".into()),
        });
        assert_eq!(msg["setup"]["model"], "models/live");
        assert!(msg["setup"]["tools"][0]["functionDeclarations"].is_array());
        assert_eq!(
            msg["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert!(msg["setup"]["inputAudioTranscription"].is_object());
    }

    #[test]
    fn closed_channel_refuses_sends() {
        let (channel, mut rx) = LiveChannel::detached();
        channel.send_text("[SYSTEM] START question_id=q1").unwrap();
        assert!(rx.try_recv().is_ok());
        channel.close();
        channel.close();
        assert!(matches!(channel.send_text("x"), Err(VoiceError::ChannelClosed)));
    }
}
