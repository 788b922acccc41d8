//! Stage A: best-effort semantic candidate from the text-completion collaborator.
//!
//! The collaborator reads the transcript, the raw answers and the catalogue and proposes
//! a value per key. Its output is advisory: every failure collapses to an empty
//! candidate and Stage B closes the record regardless.

use crate::error::{AuditError, AuditResult};
use crate::schema::Catalogue;
use crate::session::{AnswerValue, InterviewSession, Role, TranscriptEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const MAPPING_SYSTEM_PROMPT: &str = "You convert a spoken audit interview into structured answers. \
You receive the question catalogue, the raw answers recorded during the conversation and the full transcript. \
Return ONE JSON object and nothing else. Keys are question ids (and escape field names). \
For single_select use the exact text of one allowed option. \
For multi_select use an array of exact option texts. \
For boolean use true or false. For free_text use a string. \
When the answer fits no option and the question has an escape option, use the escape option and put the respondent's words under the escape field.";

/// Untrusted proposal: schema key -> JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationCandidate {
    values: BTreeMap<String, serde_json::Value>,
}

impl NormalizationCandidate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Extract the first JSON object from model output (tolerates code fences and
    /// surrounding prose). `None` when no object can be parsed.
    pub fn from_model_text(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        match serde_json::from_str::<serde_json::Value>(&text[start..=end]).ok()? {
            serde_json::Value::Object(map) => Some(Self {
                values: map.into_iter().collect(),
            }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// String view of a value; numbers and booleans are rendered, arrays joined.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(scalar_text)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            _ => None,
        }
    }

    /// List view of a value; a scalar becomes a one-item list.
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            serde_json::Value::Array(items) => Some(items.iter().filter_map(scalar_text).collect()),
            other => scalar_text(other).map(|s| vec![s]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

fn scalar_text(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Catalogue entry as presented to the collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionBrief {
    pub id: String,
    pub label: String,
    pub kind: &'static str,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escape_option: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escape_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_selections: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptLine {
    pub role: &'static str,
    pub text: String,
}

/// Everything the collaborator sees for one session.
#[derive(Debug, Clone, Serialize)]
pub struct MappingRequest {
    pub session_id: String,
    pub questions: Vec<QuestionBrief>,
    pub raw_answers: BTreeMap<String, AnswerValue>,
    pub transcript: Vec<TranscriptLine>,
}

impl MappingRequest {
    pub fn new(catalogue: &Catalogue, session: &InterviewSession) -> Self {
        let questions = catalogue
            .questions()
            .iter()
            .map(|q| QuestionBrief {
                id: q.id.clone(),
                label: q.prompt.clone(),
                kind: q.kind.as_str(),
                options: q.options.clone(),
                escape_option: q.other_label.clone(),
                escape_field: q.other_field.clone(),
                max_selections: q.max_selections,
            })
            .collect();
        Self {
            session_id: session.id.clone(),
            questions,
            raw_answers: session.answers.clone(),
            transcript: session.transcript.iter().map(transcript_line).collect(),
        }
    }
}

fn transcript_line(entry: &TranscriptEntry) -> TranscriptLine {
    TranscriptLine {
        role: match entry.role {
            Role::User => "user",
            Role::Model => "assistant",
        },
        text: entry.text.clone(),
    }
}

/// The one-shot text-completion collaborator.
#[async_trait]
pub trait SemanticMapper: Send + Sync {
    async fn map(&self, request: &MappingRequest) -> AuditResult<NormalizationCandidate>;
}

/// Mapper used when no completion endpoint is configured.
#[derive(Debug, Default)]
pub struct DisabledMapper;

#[async_trait]
impl SemanticMapper for DisabledMapper {
    async fn map(&self, _request: &MappingRequest) -> AuditResult<NormalizationCandidate> {
        Err(AuditError::Mapping("semantic mapping disabled".to_string()))
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completion mapper (OpenAI, OpenRouter, Gemini compat endpoint).
pub struct OpenAiCompatMapper {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatMapper {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SemanticMapper for OpenAiCompatMapper {
    async fn map(&self, request: &MappingRequest) -> AuditResult<NormalizationCandidate> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MAPPING_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: serde_json::to_string(request)?,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let url = format!("{}/chat/completions", self.api_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuditError::Mapping(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(AuditError::Mapping(format!("status {}: {}", status, text)));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| AuditError::Mapping(format!("invalid response body: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AuditError::Mapping("empty completion".to_string()))?;

        NormalizationCandidate::from_model_text(&content)
            .ok_or_else(|| AuditError::Mapping("completion is not a JSON object".to_string()))
    }
}

/// Run Stage A under `timeout`. Never fails: every error becomes an empty candidate.
pub async fn fetch_candidate(
    mapper: &dyn SemanticMapper,
    request: &MappingRequest,
    timeout: Duration,
) -> NormalizationCandidate {
    match tokio::time::timeout(timeout, mapper.map(request)).await {
        Ok(Ok(candidate)) => {
            debug!(session_id = %request.session_id, keys = candidate.len(), "semantic candidate received");
            candidate
        }
        Ok(Err(e)) => {
            warn!(session_id = %request.session_id, error = %e, "semantic mapping failed; using deterministic closure only");
            NormalizationCandidate::empty()
        }
        Err(_) => {
            warn!(session_id = %request.session_id, timeout_ms = timeout.as_millis() as u64, "semantic mapping timed out; using deterministic closure only");
            NormalizationCandidate::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowMapper;

    #[async_trait]
    impl SemanticMapper for SlowMapper {
        async fn map(&self, _request: &MappingRequest) -> AuditResult<NormalizationCandidate> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(NormalizationCandidate::from_map(BTreeMap::from([(
                "x".to_string(),
                serde_json::json!("y"),
            )])))
        }
    }

    fn request() -> MappingRequest {
        let catalogue = Catalogue::builtin().unwrap();
        MappingRequest::new(&catalogue, &InterviewSession::new())
    }

    #[test]
    fn parses_object_inside_code_fence() {
        let text = "Voici:\n```json\n{\"company_size\": \"11-50\", \"has_dpo\": true}\n```";
        let c = NormalizationCandidate::from_model_text(text).unwrap();
        assert_eq!(c.text("company_size").as_deref(), Some("11-50"));
        assert_eq!(c.text("has_dpo").as_deref(), Some("true"));
    }

    #[test]
    fn rejects_non_objects() {
        assert!(NormalizationCandidate::from_model_text("[1,2]").is_none());
        assert!(NormalizationCandidate::from_model_text("no json here").is_none());
        assert!(NormalizationCandidate::from_model_text("{broken").is_none());
    }

    #[test]
    fn null_values_count_as_absent() {
        let c = NormalizationCandidate::from_model_text(r#"{"a": null, "b": [1, "x"]}"#).unwrap();
        assert!(c.get("a").is_none());
        assert_eq!(c.list("b"), Some(vec!["1".to_string(), "x".to_string()]));
    }

    #[test]
    fn request_carries_catalogue_options() {
        let r = request();
        let brief = r.questions.iter().find(|q| q.id == "ai_use_cases").unwrap();
        assert_eq!(brief.kind, "multi_select");
        assert_eq!(brief.escape_field.as_deref(), Some("ai_use_cases_other"));
    }

    #[tokio::test]
    async fn timeout_yields_empty_candidate() {
        let c = fetch_candidate(&SlowMapper, &request(), Duration::from_millis(20)).await;
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn errors_yield_empty_candidate() {
        let c = fetch_candidate(&DisabledMapper, &request(), Duration::from_secs(1)).await;
        assert!(c.is_empty());
    }
}
