//! Answer normalization: best-effort semantic mapping (Stage A) followed by
//! deterministic schema closure (Stage B).

mod candidate;
mod closure;
mod scoring;
pub mod text;

pub use candidate::{
    fetch_candidate, DisabledMapper, MappingRequest, NormalizationCandidate, OpenAiCompatMapper,
    QuestionBrief, SemanticMapper, TranscriptLine,
};
pub use closure::{close_payload, name_from_email, ClosureMeta, GuaranteedPayload, PayloadMeta, PayloadValue};
pub use scoring::{top_keyword_labels, ScoringPolicy};

use crate::schema::Catalogue;
use crate::session::InterviewSession;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Folded answers counted as "yes". Everything else is "no".
const AFFIRMATIVE: &[&str] = &[
    "oui", "yes", "true", "vrai", "1", "ok", "d accord", "bien sur", "absolument", "exact",
    "exactement", "affirmatif", "tout a fait", "certainement", "evidemment", "yeah", "yep",
    "sure", "of course", "indeed", "correct",
];

/// Case, accent and punctuation insensitive affirmative check.
/// Accepts a vocabulary word alone or leading a longer answer ("Oui, depuis 2021").
pub fn is_affirmative(input: &str) -> bool {
    let folded = text::fold(input);
    AFFIRMATIVE.iter().any(|word| {
        folded == *word
            || folded
                .strip_prefix(word)
                .map(|rest| rest.starts_with(' '))
                .unwrap_or(false)
    })
}

/// Runs both stages for a finished session.
#[derive(Clone)]
pub struct Normalizer {
    catalogue: Arc<Catalogue>,
    policy: ScoringPolicy,
    mapper: Arc<dyn SemanticMapper>,
    source: String,
    name_field: String,
    email_field: String,
}

impl Normalizer {
    pub fn new(catalogue: Arc<Catalogue>, mapper: Arc<dyn SemanticMapper>, source: impl Into<String>) -> Self {
        Self {
            catalogue,
            policy: ScoringPolicy::default(),
            mapper,
            source: source.into(),
            name_field: "respondent_name".to_string(),
            email_field: "email".to_string(),
        }
    }

    pub fn with_policy(mut self, policy: ScoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_identity_fields(mut self, name_field: impl Into<String>, email_field: impl Into<String>) -> Self {
        self.name_field = name_field.into();
        self.email_field = email_field.into();
        self
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Stage A only. Never fails.
    pub async fn candidate(&self, session: &InterviewSession, timeout: Duration) -> NormalizationCandidate {
        let request = MappingRequest::new(&self.catalogue, session);
        fetch_candidate(self.mapper.as_ref(), &request, timeout).await
    }

    /// Stage B only. Pure.
    pub fn close(
        &self,
        session: &InterviewSession,
        candidate: &NormalizationCandidate,
        submitted_at: DateTime<Utc>,
    ) -> GuaranteedPayload {
        let meta = ClosureMeta {
            session_id: session.id.clone(),
            source: self.source.clone(),
            submitted_at,
            name_field: self.name_field.clone(),
            email_field: self.email_field.clone(),
        };
        close_payload(&self.catalogue, &self.policy, &session.answers, candidate, &meta)
    }

    /// Stage A under `mapping_timeout`, then Stage B.
    pub async fn normalize(&self, session: &InterviewSession, mapping_timeout: Duration) -> GuaranteedPayload {
        let candidate = self.candidate(session, mapping_timeout).await;
        self.close(session, &candidate, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_vocabulary() {
        for yes in ["Oui", "oui, depuis 2021", "Bien sûr", "D'accord", "YES", "tout à fait"] {
            assert!(is_affirmative(yes), "{yes}");
        }
        for no in ["non", "pas encore", "", "ouille", "okay-ish maybe"] {
            assert!(!is_affirmative(no), "{no}");
        }
    }
}
