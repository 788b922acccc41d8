//! Submission pipeline: normalize a finished session and deliver it once.
//!
//! Stage A, Stage B and the delivery POST share one overall deadline. A watchdog task
//! cancels a shared [`CancellationToken`] when the deadline passes; delivery observes it
//! and reports [`SubmissionError::DeadlineExceeded`]. There is no retry.

use crate::error::AuditError;
use crate::machine::InterviewMachine;
use crate::normalize::{GuaranteedPayload, NormalizationCandidate, Normalizer};
use crate::session::InterviewSession;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("submission deadline exceeded")]
    DeadlineExceeded,
    #[error("endpoint rejected the payload with status {0}")]
    Rejected(u16),
    #[error("network error: {0}")]
    Network(String),
}

/// Observable submission state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubmissionState {
    #[default]
    Idle,
    Submitting,
    Success,
    Error(SubmissionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Delivered(GuaranteedPayload),
    Failed(SubmissionError),
    /// The session was already claimed by an earlier submission.
    Skipped,
}

/// Where guaranteed payloads go.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    async fn deliver(&self, payload: &GuaranteedPayload, cancel: &CancellationToken) -> Result<(), SubmissionError>;
}

/// JSON POST to a webhook URL; any non-2xx status is a rejection.
pub struct WebhookDelivery {
    url: String,
    client: reqwest::Client,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryEndpoint for WebhookDelivery {
    async fn deliver(&self, payload: &GuaranteedPayload, cancel: &CancellationToken) -> Result<(), SubmissionError> {
        let request = self.client.post(&self.url).json(payload).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SubmissionError::DeadlineExceeded),
            res = request => res,
        };
        match response {
            Ok(res) if res.status().is_success() => Ok(()),
            Ok(res) => Err(SubmissionError::Rejected(res.status().as_u16())),
            Err(e) if e.is_timeout() => Err(SubmissionError::DeadlineExceeded),
            Err(e) => Err(SubmissionError::Network(e.to_string())),
        }
    }
}

/// Stand-in used when no webhook is configured.
pub struct UnconfiguredDelivery;

#[async_trait]
impl DeliveryEndpoint for UnconfiguredDelivery {
    async fn deliver(&self, _payload: &GuaranteedPayload, _cancel: &CancellationToken) -> Result<(), SubmissionError> {
        Err(SubmissionError::Network("no webhook configured".to_string()))
    }
}

pub struct SubmissionPipeline {
    machine: InterviewMachine,
    normalizer: Normalizer,
    delivery: Arc<dyn DeliveryEndpoint>,
    deadline: Duration,
    mapping_timeout: Duration,
    state: watch::Sender<SubmissionState>,
}

impl SubmissionPipeline {
    pub fn new(
        machine: InterviewMachine,
        normalizer: Normalizer,
        delivery: Arc<dyn DeliveryEndpoint>,
        deadline: Duration,
        mapping_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SubmissionState::Idle);
        Self {
            machine,
            normalizer,
            delivery,
            deadline,
            mapping_timeout,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SubmissionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SubmissionState {
        self.state.borrow().clone()
    }

    /// Automatic submission of a finished session. Skipped if already claimed.
    pub async fn submit(&self, session_id: &str) -> SubmissionOutcome {
        let session = match self.machine.claim_submission(session_id) {
            Ok(session) => session,
            Err(AuditError::AlreadySubmitted(_)) => {
                warn!(session_id = %session_id, "session already submitted; skipping");
                return SubmissionOutcome::Skipped;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "cannot claim session for submission");
                return self.fail(session_id, SubmissionError::Network(e.to_string()));
            }
        };
        self.run(&session).await
    }

    /// Explicit manual re-delivery; ignores the claim flag.
    pub async fn resubmit(&self, session_id: &str) -> SubmissionOutcome {
        let Some(session) = self.machine.store().get(session_id) else {
            return self.fail(session_id, SubmissionError::Network(format!("session {session_id} not found")));
        };
        if !session.finished {
            return self.fail(session_id, SubmissionError::Network(format!("session {session_id} is not finished")));
        }
        if let Err(AuditError::AlreadySubmitted(_)) = self.machine.claim_submission(session_id) {
            info!(session_id = %session_id, "manual re-delivery of an already submitted session");
        }
        self.run(&session).await
    }

    async fn run(&self, session: &InterviewSession) -> SubmissionOutcome {
        self.state.send_replace(SubmissionState::Submitting);
        info!(session_id = %session.id, deadline_ms = self.deadline.as_millis() as u64, "submission started");

        let cancel = CancellationToken::new();
        let watchdog = {
            let cancel = cancel.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let mapping_budget = self.mapping_timeout.min(self.deadline);
        let candidate = tokio::select! {
            _ = cancel.cancelled() => NormalizationCandidate::empty(),
            c = self.normalizer.candidate(session, mapping_budget) => c,
        };
        let payload = self.normalizer.close(session, &candidate, Utc::now());

        let result = if cancel.is_cancelled() {
            Err(SubmissionError::DeadlineExceeded)
        } else {
            self.delivery.deliver(&payload, &cancel).await
        };
        watchdog.abort();

        match result {
            Ok(()) => {
                info!(session_id = %session.id, respondent = %payload.meta.respondent_name, "submission delivered");
                self.state.send_replace(SubmissionState::Success);
                SubmissionOutcome::Delivered(payload)
            }
            Err(e) => self.fail(&session.id, e),
        }
    }

    fn fail(&self, session_id: &str, err: SubmissionError) -> SubmissionOutcome {
        error!(session_id = %session_id, error = %err, "submission failed");
        self.state.send_replace(SubmissionState::Error(err.clone()));
        SubmissionOutcome::Failed(err)
    }

    /// Drain the queue of finished sessions, submitting each in arrival order.
    pub fn spawn_worker(self: Arc<Self>, mut finished: mpsc::UnboundedReceiver<InterviewSession>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(session) = finished.recv().await {
                self.submit(&session.id).await;
            }
        })
    }
}
