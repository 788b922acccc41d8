//! Interview session record and the raw answer values it collects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A raw answer as committed by the conversational model. Not validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Flag(bool),
    List(Vec<String>),
    Text(String),
}

impl AnswerValue {
    /// True when the value carries no usable content.
    pub fn is_blank(&self) -> bool {
        match self {
            AnswerValue::Flag(_) => false,
            AnswerValue::List(items) => items.iter().all(|s| s.trim().is_empty()),
            AnswerValue::Text(s) => s.trim().is_empty(),
        }
    }

    /// Flattened textual rendering, used for prompts and free-text fallbacks.
    pub fn as_text(&self) -> String {
        match self {
            AnswerValue::Flag(true) => "true".to_string(),
            AnswerValue::Flag(false) => "false".to_string(),
            AnswerValue::List(items) => items.join(", "),
            AnswerValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// How a session reached `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Closure {
    /// Every question received a committed answer.
    Completed,
    /// The model gave up on the conversation (silence or repeated misunderstanding).
    Technical,
}

/// One audit attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Index of the next question to ask; equals the catalogue length once complete.
    pub question_index: usize,
    #[serde(default)]
    pub answers: BTreeMap<String, AnswerValue>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closure: Option<Closure>,
    /// Set once a delivery attempt has been started for this session.
    #[serde(default)]
    pub submission_claimed: bool,
}

impl InterviewSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            question_index: 0,
            answers: BTreeMap::new(),
            transcript: Vec::new(),
            finished: false,
            error_count: 0,
            finished_at: None,
            closure: None,
            submission_claimed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }

    pub(crate) fn finish(&mut self, closure: Closure) {
        self.finished = true;
        self.closure = Some(closure);
        self.finished_at = Some(Utc::now());
    }
}

impl Default for InterviewSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_values_serialize_untagged() {
        let json = serde_json::to_string(&AnswerValue::List(vec!["a".into(), "b".into()])).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: AnswerValue = serde_json::from_str("true").unwrap();
        assert_eq!(back, AnswerValue::Flag(true));
        let back: AnswerValue = serde_json::from_str(r#""texte""#).unwrap();
        assert_eq!(back, AnswerValue::Text("texte".into()));
    }

    #[test]
    fn blank_detection() {
        assert!(AnswerValue::Text("  ".into()).is_blank());
        assert!(AnswerValue::List(vec![" ".into()]).is_blank());
        assert!(!AnswerValue::Flag(false).is_blank());
    }

    #[test]
    fn new_session_starts_at_first_question() {
        let s = InterviewSession::new();
        assert_eq!(s.question_index, 0);
        assert!(s.is_active());
        assert!(s.closure.is_none());
    }
}
