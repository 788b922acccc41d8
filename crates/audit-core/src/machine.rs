//! Interview session state machine.
//!
//! ```text
//!   Idle ──enter──▶ Active ──commit (last question)──▶ Finished ──archive──▶ Idle
//!                    │  ▲                               ▲
//!                    └──┘ commit                        │
//!                    └────────── technical closure ─────┘
//! ```
//!
//! Every transition runs through the [`SessionStore`], which persists the result.

use crate::error::{AuditError, AuditResult};
use crate::schema::{Catalogue, QuestionSchema};
use crate::session::{AnswerValue, Closure, InterviewSession, TranscriptEntry};
use crate::store::SessionStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle phase of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    Finished,
}

/// Result of entering an interview.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// A new session was created; the model starts at `question_id`.
    Fresh { session_id: String, question_id: String },
    /// The current session was still active; the model resumes at `question_id`.
    Resume { session_id: String, question_id: String },
}

impl Entry {
    pub fn session_id(&self) -> &str {
        match self {
            Entry::Fresh { session_id, .. } | Entry::Resume { session_id, .. } => session_id,
        }
    }

    pub fn question_id(&self) -> &str {
        match self {
            Entry::Fresh { question_id, .. } | Entry::Resume { question_id, .. } => question_id,
        }
    }
}

/// Result of committing an answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// Pointer advanced; `next` is the question now expected (if the pointer did not
    /// reach the end).
    Advanced { session_id: String, next: String },
    /// The last question was answered; the session is now finished.
    Completed(InterviewSession),
}

/// Owns the transition rules for interview sessions.
#[derive(Clone)]
pub struct InterviewMachine {
    store: Arc<SessionStore>,
    catalogue: Arc<Catalogue>,
}

impl InterviewMachine {
    pub fn new(store: Arc<SessionStore>, catalogue: Arc<Catalogue>) -> Self {
        Self { store, catalogue }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn phase(&self) -> Phase {
        match self.store.current() {
            None => Phase::Idle,
            Some(s) if s.finished => Phase::Finished,
            Some(_) => Phase::Active,
        }
    }

    /// The question the current session is waiting on.
    pub fn current_question(&self) -> Option<&QuestionSchema> {
        let session = self.store.current().filter(InterviewSession::is_active)?;
        self.catalogue.at(session.question_index)
    }

    /// Start or resume an interview.
    ///
    /// An active current session is resumed at its pointer. A finished or missing one is
    /// replaced by a new session.
    pub fn enter(&self) -> Entry {
        if let Some(session) = self.store.current().filter(InterviewSession::is_active) {
            if let Some(question) = self.catalogue.at(session.question_index) {
                info!(session_id = %session.id, question = %question.id, "resuming interview");
                return Entry::Resume {
                    session_id: session.id,
                    question_id: question.id.clone(),
                };
            }
        }
        let session = self.store.create();
        let first = self
            .catalogue
            .at(0)
            .map(|q| q.id.clone())
            .unwrap_or_default();
        info!(session_id = %session.id, question = %first, "starting interview");
        Entry::Fresh {
            session_id: session.id,
            question_id: first,
        }
    }

    /// Write a raw answer and advance the pointer past `question_id`.
    ///
    /// The pointer never moves backwards: answering an earlier question again only
    /// overwrites its value.
    pub fn commit_answer(
        &self,
        question_id: &str,
        value: Option<AnswerValue>,
        other_text: Option<String>,
    ) -> AuditResult<Commit> {
        let question = self
            .catalogue
            .get(question_id)
            .ok_or_else(|| AuditError::UnknownQuestion(question_id.to_string()))?;
        let position = self
            .catalogue
            .position(question_id)
            .ok_or_else(|| AuditError::UnknownQuestion(question_id.to_string()))?;
        let session_id = self.active_session_id()?;
        let total = self.catalogue.len();

        let completed = self.store.update(&session_id, |session| {
            if session.finished {
                return Err(AuditError::NoActiveSession);
            }
            if let Some(value) = value {
                session.answers.insert(question.id.clone(), value);
            }
            if let (Some(field), Some(text)) = (question.other_field.as_ref(), other_text) {
                if !text.trim().is_empty() {
                    session.answers.insert(field.clone(), AnswerValue::Text(text));
                }
            }
            session.question_index = session.question_index.max(position + 1);
            if session.question_index >= total {
                session.question_index = total;
                session.finish(Closure::Completed);
                return Ok(Some(session.clone()));
            }
            Ok(None)
        })?;

        match completed {
            Some(session) => {
                info!(session_id = %session.id, answers = session.answers.len(), "interview completed");
                Ok(Commit::Completed(session))
            }
            None => {
                let next = self
                    .store
                    .get(&session_id)
                    .and_then(|s| self.catalogue.at(s.question_index))
                    .map(|q| q.id.clone())
                    .unwrap_or_default();
                debug!(session_id = %session_id, answered = %question_id, next = %next, "answer recorded");
                Ok(Commit::Advanced { session_id, next })
            }
        }
    }

    /// Finish the current session with whatever answers exist.
    pub fn technical_closure(&self) -> AuditResult<InterviewSession> {
        let session_id = self.active_session_id()?;
        let session = self.store.update(&session_id, |session| {
            if session.finished {
                return Err(AuditError::NoActiveSession);
            }
            session.finish(Closure::Technical);
            Ok(session.clone())
        })?;
        info!(session_id = %session.id, answers = session.answers.len(), "technical closure");
        Ok(session)
    }

    /// Append completed turns to the session transcript.
    pub fn record_turns(&self, session_id: &str, entries: Vec<TranscriptEntry>) -> AuditResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.update(session_id, |session| {
            session.transcript.extend(entries);
            Ok(())
        })
    }

    pub fn set_error_count(&self, session_id: &str, count: u32) -> AuditResult<()> {
        self.store.update(session_id, |session| {
            session.error_count = count;
            Ok(())
        })
    }

    /// Drop a finished session from "current" after its display grace period.
    /// It stays in history. No-op when another session became current meanwhile.
    pub fn archive(&self, session_id: &str) -> bool {
        let is_finished_current = self
            .store
            .current()
            .map(|s| s.id == session_id && s.finished)
            .unwrap_or(false);
        if is_finished_current {
            self.store.set_current(None);
            debug!(session_id = %session_id, "finished session archived");
        }
        is_finished_current
    }

    /// Archive whatever finished session is current.
    pub fn archive_current(&self) -> bool {
        match self.store.current() {
            Some(s) => self.archive(&s.id),
            None => false,
        }
    }

    /// Mark a finished session as submitted. Fails if a submission was already started,
    /// so a session is never delivered twice automatically.
    pub fn claim_submission(&self, session_id: &str) -> AuditResult<InterviewSession> {
        self.store.update(session_id, |session| {
            if session.submission_claimed {
                return Err(AuditError::AlreadySubmitted(session.id.clone()));
            }
            session.submission_claimed = true;
            Ok(session.clone())
        })
    }

    fn active_session_id(&self) -> AuditResult<String> {
        self.store
            .current()
            .filter(InterviewSession::is_active)
            .map(|s| s.id)
            .ok_or(AuditError::NoActiveSession)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> InterviewMachine {
        InterviewMachine::new(
            Arc::new(SessionStore::new()),
            Arc::new(Catalogue::builtin().unwrap()),
        )
    }

    #[test]
    fn enter_from_idle_creates_fresh_session() {
        let m = machine();
        assert_eq!(m.phase(), Phase::Idle);
        let entry = m.enter();
        assert!(matches!(entry, Entry::Fresh { .. }));
        assert_eq!(entry.question_id(), "respondent_name");
        assert_eq!(m.phase(), Phase::Active);
    }

    #[test]
    fn enter_on_active_session_resumes_at_pointer() {
        let m = machine();
        let first = m.enter();
        m.commit_answer("respondent_name", Some(AnswerValue::Text("Ana".into())), None)
            .unwrap();
        let second = m.enter();
        assert_eq!(
            second,
            Entry::Resume {
                session_id: first.session_id().to_string(),
                question_id: "email".to_string(),
            }
        );
        assert_eq!(m.store().list().len(), 1);
    }

    #[test]
    fn enter_after_finish_creates_new_session() {
        let m = machine();
        let first = m.enter();
        m.technical_closure().unwrap();
        assert_eq!(m.phase(), Phase::Finished);
        let second = m.enter();
        assert!(matches!(second, Entry::Fresh { .. }));
        assert_ne!(first.session_id(), second.session_id());
    }

    #[test]
    fn unknown_question_leaves_state_untouched() {
        let m = machine();
        m.enter();
        let err = m.commit_answer("nope", Some(AnswerValue::Text("x".into())), None).unwrap_err();
        assert!(matches!(err, AuditError::UnknownQuestion(_)));
        assert_eq!(m.store().current().unwrap().question_index, 0);
    }

    #[test]
    fn commit_without_session_fails() {
        let m = machine();
        let err = m.commit_answer("email", None, None).unwrap_err();
        assert!(matches!(err, AuditError::NoActiveSession));
    }

    #[test]
    fn answering_an_earlier_question_never_moves_pointer_back() {
        let m = machine();
        m.enter();
        m.commit_answer("company_size", Some(AnswerValue::Text("2".into())), None)
            .unwrap();
        assert_eq!(m.store().current().unwrap().question_index, 3);
        m.commit_answer("email", Some(AnswerValue::Text("a@b.fr".into())), None)
            .unwrap();
        assert_eq!(m.store().current().unwrap().question_index, 3);
    }

    #[test]
    fn escape_text_is_stored_under_escape_field() {
        let m = machine();
        m.enter();
        m.commit_answer(
            "ai_use_cases",
            Some(AnswerValue::List(vec!["Autre".into()])),
            Some("tri du courrier".into()),
        )
        .unwrap();
        let s = m.store().current().unwrap();
        assert_eq!(
            s.answers.get("ai_use_cases_other"),
            Some(&AnswerValue::Text("tri du courrier".into()))
        );
    }

    #[test]
    fn archive_only_applies_to_finished_current_session() {
        let m = machine();
        let entry = m.enter();
        assert!(!m.archive(entry.session_id()));
        m.technical_closure().unwrap();
        assert!(m.archive(entry.session_id()));
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(m.store().list().len(), 1);
    }

    #[test]
    fn submission_can_be_claimed_once() {
        let m = machine();
        let entry = m.enter();
        m.technical_closure().unwrap();
        m.claim_submission(entry.session_id()).unwrap();
        let err = m.claim_submission(entry.session_id()).unwrap_err();
        assert!(matches!(err, AuditError::AlreadySubmitted(_)));
    }
}
