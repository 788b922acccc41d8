//! Tool-call dispatcher: turns model-issued function invocations into state transitions.
//!
//! Arguments are parsed into [`ToolCall`] at the boundary. Every invocation is answered
//! with a [`ToolAck`] carrying a short textual result; validation failures never change
//! state. Sessions that reach `finished` are handed to the submission queue.

use crate::error::AuditError;
use crate::machine::{Commit, InterviewMachine};
use crate::normalize::is_affirmative;
use crate::schema::{QuestionKind, QuestionSchema};
use crate::session::{AnswerValue, InterviewSession};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const RECORD_ANSWER: &str = "record_answer";
pub const TECHNICAL_CLOSURE: &str = "technical_closure";

pub const ACK_RECORDED: &str = "recorded";
pub const ACK_COMPLETE: &str = "recorded: interview complete";
pub const ACK_CLOSED: &str = "closed";

/// A raw function invocation as received from the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Typed arguments of `record_answer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAnswer {
    pub question_id: String,
    pub value: Option<String>,
    pub multi_values: Option<Vec<String>>,
    pub other_free_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    RecordAnswer(RecordAnswer),
    TechnicalClosure,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    #[error("error: unknown tool {0}")]
    UnknownTool(String),
    #[error("error: invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("error: unknown question id {0}")]
    UnknownQuestion(String),
    #[error("error: no active session")]
    NoActiveSession,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordAnswerWire {
    question_id: Option<serde_json::Value>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    multi_values: Option<serde_json::Value>,
    #[serde(default)]
    other_free_text: Option<serde_json::Value>,
}

/// Models send numbers and booleans where strings are declared; accept them as text.
fn lenient_text(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_list(value: Option<serde_json::Value>) -> Option<Vec<String>> {
    match value? {
        serde_json::Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|v| lenient_text(Some(v)))
                .filter(|s| !s.trim().is_empty())
                .collect(),
        ),
        other => lenient_text(Some(other)).map(|s| vec![s]),
    }
}

impl ToolCall {
    pub fn parse(name: &str, args: &serde_json::Value) -> Result<Self, ToolCallError> {
        match name {
            RECORD_ANSWER => {
                let args = if args.is_null() {
                    serde_json::Value::Object(Default::default())
                } else {
                    args.clone()
                };
                let wire: RecordAnswerWire = serde_json::from_value(args)
                    .map_err(|e| ToolCallError::InvalidArguments(e.to_string()))?;
                let question_id = lenient_text(wire.question_id)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ToolCallError::InvalidArguments("questionId is required".to_string()))?;
                Ok(ToolCall::RecordAnswer(RecordAnswer {
                    question_id,
                    value: lenient_text(wire.value),
                    multi_values: lenient_list(wire.multi_values).filter(|v| !v.is_empty()),
                    other_free_text: lenient_text(wire.other_free_text).filter(|s| !s.trim().is_empty()),
                }))
            }
            TECHNICAL_CLOSURE => Ok(ToolCall::TechnicalClosure),
            other => Err(ToolCallError::UnknownTool(other.to_string())),
        }
    }
}

impl RecordAnswer {
    /// Shape the raw value for storage according to the question kind. No option validation.
    fn stored_value(&self, question: &QuestionSchema) -> Option<AnswerValue> {
        match question.kind {
            QuestionKind::MultiSelect => match (&self.multi_values, &self.value) {
                (Some(list), _) => Some(AnswerValue::List(list.clone())),
                (None, Some(v)) => Some(AnswerValue::List(vec![v.clone()])),
                (None, None) => None,
            },
            QuestionKind::Boolean => self
                .value
                .as_deref()
                .or_else(|| self.multi_values.as_ref().and_then(|l| l.first()).map(String::as_str))
                .map(|v| AnswerValue::Flag(is_affirmative(v))),
            QuestionKind::SingleSelect | QuestionKind::FreeText => self
                .value
                .clone()
                .or_else(|| self.multi_values.as_ref().map(|l| l.join(", ")))
                .map(AnswerValue::Text),
        }
    }
}

/// Response sent back to the model for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAck {
    pub id: String,
    pub name: String,
    pub result: String,
}

impl ToolAck {
    pub fn is_error(&self) -> bool {
        self.result.starts_with("error:")
    }
}

/// Applies tool calls to the state machine. Finished sessions are queued on `completed`.
#[derive(Clone)]
pub struct ToolDispatcher {
    machine: InterviewMachine,
    completed: mpsc::UnboundedSender<InterviewSession>,
}

impl ToolDispatcher {
    pub fn new(machine: InterviewMachine, completed: mpsc::UnboundedSender<InterviewSession>) -> Self {
        Self { machine, completed }
    }

    pub fn dispatch(&self, invocation: &ToolInvocation) -> ToolAck {
        let result = match ToolCall::parse(&invocation.name, &invocation.args).and_then(|call| self.apply(call)) {
            Ok(ack) => ack.to_string(),
            Err(e) => {
                warn!(tool = %invocation.name, call_id = %invocation.id, error = %e, "tool call rejected");
                e.to_string()
            }
        };
        ToolAck {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            result,
        }
    }

    fn apply(&self, call: ToolCall) -> Result<&'static str, ToolCallError> {
        match call {
            ToolCall::RecordAnswer(answer) => {
                let question = self
                    .machine
                    .catalogue()
                    .get(&answer.question_id)
                    .ok_or_else(|| ToolCallError::UnknownQuestion(answer.question_id.clone()))?;
                let value = answer.stored_value(question);
                let commit = self
                    .machine
                    .commit_answer(&answer.question_id, value, answer.other_free_text.clone())
                    .map_err(|e| self.map_error(e, &answer.question_id))?;
                match commit {
                    Commit::Advanced { session_id, next } => {
                        debug!(session_id = %session_id, question = %answer.question_id, next = %next, "record_answer applied");
                        Ok(ACK_RECORDED)
                    }
                    Commit::Completed(session) => {
                        self.queue(session);
                        Ok(ACK_COMPLETE)
                    }
                }
            }
            ToolCall::TechnicalClosure => {
                let session = self
                    .machine
                    .technical_closure()
                    .map_err(|e| self.map_error(e, ""))?;
                self.queue(session);
                Ok(ACK_CLOSED)
            }
        }
    }

    fn map_error(&self, err: AuditError, question_id: &str) -> ToolCallError {
        match err {
            AuditError::UnknownQuestion(id) => ToolCallError::UnknownQuestion(id),
            AuditError::NoActiveSession => ToolCallError::NoActiveSession,
            other => ToolCallError::InvalidArguments(format!("{question_id}: {other}")),
        }
    }

    fn queue(&self, session: InterviewSession) {
        info!(session_id = %session.id, closure = ?session.closure, "session finished; queued for submission");
        if self.completed.send(session).is_err() {
            warn!("submission queue closed; finished session not queued");
        }
    }
}

/// Function declarations advertised to the model in the session setup.
pub fn function_declarations() -> serde_json::Value {
    serde_json::json!([
        {
            "name": RECORD_ANSWER,
            "description": "Record the respondent's answer to one audit question, then move on.",
            "parameters": {
                "type": "object",
                "properties": {
                    "questionId": { "type": "string", "description": "Id of the question being answered." },
                    "value": { "type": "string", "description": "The answer, as close to an allowed option as possible." },
                    "multiValues": { "type": "array", "items": { "type": "string" }, "description": "Selected options for multi-select questions." },
                    "otherFreeText": { "type": "string", "description": "Respondent's own words when the 'other' option applies." }
                },
                "required": ["questionId"]
            }
        },
        {
            "name": TECHNICAL_CLOSURE,
            "description": "End the interview early when the conversation cannot continue (prolonged silence or repeated misunderstanding)."
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Catalogue;
    use crate::store::SessionStore;
    use serde_json::json;
    use std::sync::Arc;

    fn dispatcher() -> (ToolDispatcher, mpsc::UnboundedReceiver<InterviewSession>, InterviewMachine) {
        let machine = InterviewMachine::new(
            Arc::new(SessionStore::new()),
            Arc::new(Catalogue::builtin().unwrap()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (ToolDispatcher::new(machine.clone(), tx), rx, machine)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            id: "call-1".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn parse_accepts_numbers_where_strings_expected() {
        let parsed = ToolCall::parse(RECORD_ANSWER, &json!({"questionId": "company_size", "value": 2})).unwrap();
        assert_eq!(
            parsed,
            ToolCall::RecordAnswer(RecordAnswer {
                question_id: "company_size".into(),
                value: Some("2".into()),
                multi_values: None,
                other_free_text: None,
            })
        );
    }

    #[test]
    fn parse_rejects_missing_question_id_and_unknown_tools() {
        assert!(matches!(
            ToolCall::parse(RECORD_ANSWER, &json!({"value": "x"})),
            Err(ToolCallError::InvalidArguments(_))
        ));
        assert_eq!(
            ToolCall::parse("hang_up", &json!({})),
            Err(ToolCallError::UnknownTool("hang_up".into()))
        );
    }

    #[test]
    fn unknown_question_is_rejected_without_state_change() {
        let (d, _rx, m) = dispatcher();
        m.enter();
        let ack = d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "nope", "value": "x"})));
        assert!(ack.is_error());
        assert_eq!(ack.result, "error: unknown question id nope");
        let session = m.store().current().unwrap();
        assert_eq!(session.question_index, 0);
        assert!(session.answers.is_empty());
    }

    #[test]
    fn record_without_session_fails() {
        let (d, _rx, _m) = dispatcher();
        let ack = d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "email", "value": "a@b.fr"})));
        assert_eq!(ack.result, "error: no active session");
    }

    #[test]
    fn values_are_stored_by_kind() {
        let (d, _rx, m) = dispatcher();
        m.enter();
        d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "ai_use_cases", "value": "chatbot"})));
        d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "has_dpo", "value": "Oui, bien sûr"})));
        d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "company_size", "value": "une cinquantaine"})));
        let answers = m.store().current().unwrap().answers;
        assert_eq!(answers["ai_use_cases"], AnswerValue::List(vec!["chatbot".into()]));
        assert_eq!(answers["has_dpo"], AnswerValue::Flag(true));
        assert_eq!(answers["company_size"], AnswerValue::Text("une cinquantaine".into()));
    }

    #[test]
    fn last_answer_completes_and_queues_once() {
        let (d, mut rx, m) = dispatcher();
        m.enter();
        let ack = d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "comments", "value": "rien"})));
        assert_eq!(ack.result, ACK_COMPLETE);
        let queued = rx.try_recv().unwrap();
        assert!(queued.finished);

        let again = d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "comments", "value": "x"})));
        assert_eq!(again.result, "error: no active session");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn technical_closure_queues_partial_session() {
        let (d, mut rx, m) = dispatcher();
        m.enter();
        d.dispatch(&call(RECORD_ANSWER, json!({"questionId": "respondent_name", "value": "Ana"})));
        let ack = d.dispatch(&call(TECHNICAL_CLOSURE, serde_json::Value::Null));
        assert_eq!(ack.result, ACK_CLOSED);
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.answers.len(), 1);
        assert_eq!(d.dispatch(&call(TECHNICAL_CLOSURE, json!({}))).result, "error: no active session");
    }

    #[test]
    fn declarations_name_both_tools() {
        let decls = function_declarations();
        let names: Vec<&str> = decls.as_array().unwrap().iter().filter_map(|d| d["name"].as_str()).collect();
        assert_eq!(names, vec![RECORD_ANSWER, TECHNICAL_CLOSURE]);
    }
}
