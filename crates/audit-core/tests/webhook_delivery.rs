//! Delivery against a loopback HTTP receiver.

use audit_core::normalize::{DisabledMapper, Normalizer};
use audit_core::{
    AnswerValue, Catalogue, InterviewMachine, SessionStore, SubmissionError, SubmissionOutcome, SubmissionPipeline,
    SubmissionState, WebhookDelivery,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Inbox = Arc<Mutex<Vec<serde_json::Value>>>;

async fn accept(State(inbox): State<Inbox>, Json(body): Json<serde_json::Value>) -> StatusCode {
    inbox.lock().unwrap().push(body);
    StatusCode::OK
}

async fn spawn_receiver() -> (SocketAddr, Inbox) {
    let inbox: Inbox = Arc::default();
    let app = Router::new()
        .route("/hook", post(accept))
        .route("/reject", post(|| async { StatusCode::UNPROCESSABLE_ENTITY }))
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        )
        .with_state(inbox.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, inbox)
}

fn pipeline(url: String, deadline: Duration) -> (SubmissionPipeline, String) {
    let catalogue = Arc::new(Catalogue::builtin().unwrap());
    let machine = InterviewMachine::new(Arc::new(SessionStore::new()), catalogue.clone());
    let entry = machine.enter();
    machine
        .commit_answer("email", Some(AnswerValue::Text("jean.dupont@example.fr".into())), None)
        .unwrap();
    machine.technical_closure().unwrap();
    let normalizer = Normalizer::new(catalogue, Arc::new(DisabledMapper), "voice-audit");
    let p = SubmissionPipeline::new(
        machine,
        normalizer,
        Arc::new(WebhookDelivery::new(url)),
        deadline,
        Duration::from_secs(1),
    );
    (p, entry.session_id().to_string())
}

#[tokio::test]
async fn posts_payload_as_json() {
    let (addr, inbox) = spawn_receiver().await;
    let (p, id) = pipeline(format!("http://{addr}/hook"), Duration::from_secs(5));
    assert!(matches!(p.submit(&id).await, SubmissionOutcome::Delivered(_)));
    assert_eq!(p.state(), SubmissionState::Success);

    let received = inbox.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["session_id"], id.as_str());
    assert_eq!(received[0]["respondent_name"], "Jean Dupont");
    assert_eq!(received[0]["answers"]["email"], "jean.dupont@example.fr");
}

#[tokio::test]
async fn non_success_status_is_a_rejection() {
    let (addr, _inbox) = spawn_receiver().await;
    let (p, id) = pipeline(format!("http://{addr}/reject"), Duration::from_secs(5));
    assert_eq!(p.submit(&id).await, SubmissionOutcome::Failed(SubmissionError::Rejected(422)));
}

#[tokio::test]
async fn slow_receiver_hits_the_deadline() {
    let (addr, _inbox) = spawn_receiver().await;
    let (p, id) = pipeline(format!("http://{addr}/slow"), Duration::from_millis(200));
    assert_eq!(p.submit(&id).await, SubmissionOutcome::Failed(SubmissionError::DeadlineExceeded));
    assert_eq!(p.state(), SubmissionState::Error(SubmissionError::DeadlineExceeded));
}

#[tokio::test]
async fn unreachable_receiver_is_a_network_error() {
    let (p, id) = pipeline("http://127.0.0.1:1/hook".to_string(), Duration::from_secs(5));
    assert!(matches!(
        p.submit(&id).await,
        SubmissionOutcome::Failed(SubmissionError::Network(_))
    ));
}
