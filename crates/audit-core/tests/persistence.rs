//! Sessions and the submission claim survive a restart.

use audit_core::normalize::{DisabledMapper, Normalizer};
use audit_core::{
    AnswerValue, Catalogue, Entry, InterviewMachine, Phase, SessionStore, SubmissionOutcome, SubmissionPipeline,
    UnconfiguredDelivery,
};
use std::sync::Arc;
use std::time::Duration;

fn machine(path: &std::path::Path) -> InterviewMachine {
    InterviewMachine::new(
        Arc::new(SessionStore::open_persistent(path).unwrap()),
        Arc::new(Catalogue::builtin().unwrap()),
    )
}

#[test]
fn active_session_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let m = machine(dir.path());
        let entry = m.enter();
        m.commit_answer("respondent_name", Some(AnswerValue::Text("Ana".into())), None)
            .unwrap();
        entry.session_id().to_string()
    };
    let m = machine(dir.path());
    assert_eq!(m.phase(), Phase::Active);
    assert_eq!(
        m.enter(),
        Entry::Resume {
            session_id: id,
            question_id: "email".into()
        }
    );
}

#[tokio::test]
async fn claimed_session_is_not_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let m = machine(dir.path());
        let entry = m.enter();
        m.technical_closure().unwrap();
        let p = SubmissionPipeline::new(
            m.clone(),
            Normalizer::new(m.catalogue().clone(), Arc::new(DisabledMapper), "voice-audit"),
            Arc::new(UnconfiguredDelivery),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        assert!(matches!(p.submit(entry.session_id()).await, SubmissionOutcome::Failed(_)));
        entry.session_id().to_string()
    };

    let m = machine(dir.path());
    assert!(m.store().get(&id).unwrap().submission_claimed);
    let p = SubmissionPipeline::new(
        m.clone(),
        Normalizer::new(m.catalogue().clone(), Arc::new(DisabledMapper), "voice-audit"),
        Arc::new(UnconfiguredDelivery),
        Duration::from_secs(1),
        Duration::from_millis(100),
    );
    assert_eq!(p.submit(&id).await, SubmissionOutcome::Skipped);
}

#[test]
fn discard_removes_session_from_history() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let m = machine(dir.path());
        let entry = m.enter();
        m.store().discard(entry.session_id()).unwrap();
        entry.session_id().to_string()
    };
    let m = machine(dir.path());
    assert!(m.store().get(&id).is_none());
    assert_eq!(m.phase(), Phase::Idle);
}
