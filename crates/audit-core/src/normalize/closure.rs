//! Stage B: deterministic schema closure.
//!
//! Folds the raw answers and the (possibly empty) candidate into a record where every
//! entry satisfies its question kind. Pure: no I/O, no clock, no randomness. The same
//! inputs always serialize to the same bytes.

use super::scoring::{top_keyword_labels, ScoringPolicy};
use super::text::{bigram_similarity, fold, token_overlap};
use super::{is_affirmative, NormalizationCandidate};
use crate::schema::{Catalogue, QuestionKind, QuestionSchema};
use crate::session::AnswerValue;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Hard list separators.
static HARD_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;|\n]+").expect("valid regex"));
/// Conjunctions and slashes, tried only when a piece matches no option as a whole.
static SOFT_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*/\s*|\s+(?:et|and|ou|or|puis)\s+").expect("valid regex"));

const ANONYMOUS: &str = "Anonymous";

/// Final value of one payload entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Flag(bool),
    Choices(Vec<String>),
    /// A single allowed option label.
    Choice(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadMeta {
    pub session_id: String,
    pub source: String,
    pub submitted_at: String,
    pub respondent_name: String,
}

/// Submission-ready record: one entry per question and per escape field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuaranteedPayload {
    #[serde(flatten)]
    pub meta: PayloadMeta,
    pub answers: BTreeMap<String, PayloadValue>,
}

impl GuaranteedPayload {
    /// Check every entry against its question. Used by tests and as a delivery guard.
    pub fn conforms_to(&self, catalogue: &Catalogue) -> Result<(), String> {
        for q in catalogue.questions() {
            let value = self
                .answers
                .get(&q.id)
                .ok_or_else(|| format!("missing entry {}", q.id))?;
            let ok = match (q.kind, value) {
                (QuestionKind::SingleSelect, PayloadValue::Choice(label)) => q.is_allowed(label),
                (QuestionKind::MultiSelect, PayloadValue::Choices(labels)) => {
                    labels.len() <= q.selection_limit() && labels.iter().all(|l| q.is_allowed(l))
                }
                (QuestionKind::Boolean, PayloadValue::Flag(_)) => true,
                (QuestionKind::FreeText, PayloadValue::Text(_)) => true,
                _ => false,
            };
            if !ok {
                return Err(format!("entry {} violates {}: {:?}", q.id, q.kind.as_str(), value));
            }
            if let Some(field) = q.other_field.as_deref() {
                if !matches!(self.answers.get(field), Some(PayloadValue::Text(_))) {
                    return Err(format!("missing escape field {}", field));
                }
            }
        }
        Ok(())
    }
}

/// Metadata inputs for closure; the timestamp is injected so closure stays pure.
#[derive(Debug, Clone)]
pub struct ClosureMeta {
    pub session_id: String,
    pub source: String,
    pub submitted_at: DateTime<Utc>,
    /// Answer key holding the respondent's name, if the catalogue asks for it.
    pub name_field: String,
    /// Answer key holding the respondent's e-mail, used to derive a name.
    pub email_field: String,
}

/// Build the guaranteed payload.
pub fn close_payload(
    catalogue: &Catalogue,
    policy: &ScoringPolicy,
    raw: &BTreeMap<String, AnswerValue>,
    candidate: &NormalizationCandidate,
    meta: &ClosureMeta,
) -> GuaranteedPayload {
    let mut answers = BTreeMap::new();
    for q in catalogue.questions() {
        let raw_value = raw.get(&q.id).filter(|v| !v.is_blank());
        let mut captured: Option<String> = None;
        let value = match q.kind {
            QuestionKind::SingleSelect => {
                PayloadValue::Choice(resolve_single(q, policy, raw_value, candidate, &mut captured))
            }
            QuestionKind::MultiSelect => {
                let escape_text = q.other_field.as_deref().and_then(|f| escape_field_text(raw, candidate, f));
                PayloadValue::Choices(resolve_multi(q, raw_value, candidate, escape_text, &mut captured))
            }
            QuestionKind::Boolean => PayloadValue::Flag(resolve_bool(&q.id, raw_value, candidate)),
            QuestionKind::FreeText => PayloadValue::Text(resolve_text(&q.id, raw_value, candidate)),
        };
        answers.insert(q.id.clone(), value);

        if let Some(field) = q.other_field.as_deref() {
            let text = escape_field_text(raw, candidate, field)
                .or(captured)
                .unwrap_or_default();
            answers.insert(field.to_string(), PayloadValue::Text(text));
        }
    }

    let respondent_name = respondent_name(&answers, raw, meta);
    GuaranteedPayload {
        meta: PayloadMeta {
            session_id: meta.session_id.clone(),
            source: meta.source.clone(),
            submitted_at: meta.submitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            respondent_name,
        },
        answers,
    }
}

fn escape_field_text(
    raw: &BTreeMap<String, AnswerValue>,
    candidate: &NormalizationCandidate,
    field: &str,
) -> Option<String> {
    raw.get(field)
        .filter(|v| !v.is_blank())
        .map(|v| v.as_text().trim().to_string())
        .or_else(|| candidate.text(field).map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Steps 1-3: exact literal, numeric index, folded equality.
fn direct_match(q: &QuestionSchema, input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let allowed = q.allowed_labels();
    if let Some(label) = allowed.iter().find(|l| **l == trimmed) {
        return Some(label.to_string());
    }
    if let Ok(n) = trimmed.parse::<usize>() {
        if (1..=q.options.len()).contains(&n) {
            return Some(q.options[n - 1].clone());
        }
    }
    let folded = fold(trimmed);
    allowed
        .iter()
        .find(|l| fold(l) == folded)
        .map(|l| l.to_string())
}

/// Step 6: best option by token overlap, bigram similarity breaking ties.
fn nearest_option(q: &QuestionSchema, input: &str) -> String {
    let mut best: Option<(f64, f64, &str)> = None;
    for label in q.allowed_labels() {
        let overlap = token_overlap(input, label);
        let similarity = bigram_similarity(input, label);
        let better = match best {
            None => true,
            Some((o, s, _)) => overlap > o || (overlap == o && similarity > s),
        };
        if better {
            best = Some((overlap, similarity, label));
        }
    }
    best.map(|(_, _, l)| l.to_string()).unwrap_or_default()
}

fn neutral_default(q: &QuestionSchema) -> String {
    q.allowed_labels().first().map(|l| l.to_string()).unwrap_or_default()
}

fn resolve_single(
    q: &QuestionSchema,
    policy: &ScoringPolicy,
    raw: Option<&AnswerValue>,
    candidate: &NormalizationCandidate,
    captured: &mut Option<String>,
) -> String {
    let proposed = candidate.text(&q.id);
    if let Some(label) = proposed.as_deref().and_then(|c| direct_match(q, c)) {
        return guard_lowest_maturity(q, policy, raw, label);
    }

    let text = raw
        .map(AnswerValue::as_text)
        .or(proposed)
        .filter(|s| !s.trim().is_empty());
    let Some(text) = text else {
        return neutral_default(q);
    };

    if let Some(label) = direct_match(q, &text) {
        return label;
    }
    if q.maturity_scale && q.other_label.is_none() {
        if let Some(label) = policy.best_maturity(q, &text) {
            return label.to_string();
        }
    }
    if let Some(other) = q.other_label.as_ref() {
        *captured = Some(text.trim().to_string());
        return other.clone();
    }
    nearest_option(q, &text)
}

/// A candidate that picks the lowest maturity level cannot override raw text that
/// scores a higher level, unless the raw text names that lowest option itself.
fn guard_lowest_maturity(q: &QuestionSchema, policy: &ScoringPolicy, raw: Option<&AnswerValue>, label: String) -> String {
    if !q.maturity_scale || q.other_label.is_some() || q.options.first() != Some(&label) {
        return label;
    }
    let Some(text) = raw.map(AnswerValue::as_text).filter(|s| !s.trim().is_empty()) else {
        return label;
    };
    if direct_match(q, &text).is_some() {
        return label;
    }
    match policy.best_maturity(q, &text) {
        Some(scored) if scored != label => scored.to_string(),
        _ => label,
    }
}

/// Split items into valid labels (deduplicated, bounded) and unmatched leftovers.
fn parse_selections(q: &QuestionSchema, items: &[String], limit: usize) -> (Vec<String>, Vec<String>) {
    fn push(label: String, labels: &mut Vec<String>) {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    let mut labels: Vec<String> = Vec::new();
    let mut leftovers = Vec::new();
    for item in items {
        for piece in HARD_SPLIT.split(item).map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(label) = direct_match(q, piece) {
                push(label, &mut labels);
                continue;
            }
            let digits_only = piece.chars().all(|c| c.is_ascii_digit() || c.is_whitespace());
            let parts: Vec<&str> = if digits_only {
                piece.split_whitespace().collect()
            } else {
                SOFT_SPLIT.split(piece).map(str::trim).filter(|p| !p.is_empty()).collect()
            };
            for part in parts {
                match direct_match(q, part) {
                    Some(label) => push(label, &mut labels),
                    None => leftovers.push(part.to_string()),
                }
            }
        }
    }
    labels.truncate(limit);
    (labels, leftovers)
}

fn resolve_multi(
    q: &QuestionSchema,
    raw: Option<&AnswerValue>,
    candidate: &NormalizationCandidate,
    escape_text: Option<String>,
    captured: &mut Option<String>,
) -> Vec<String> {
    let limit = q.selection_limit();
    if let Some(items) = candidate.list(&q.id) {
        let (labels, _) = parse_selections(q, &items, limit);
        if !labels.is_empty() {
            return labels;
        }
    }

    let raw_items = match raw {
        Some(AnswerValue::List(items)) => items.clone(),
        Some(AnswerValue::Text(s)) => vec![s.clone()],
        Some(AnswerValue::Flag(_)) | None => Vec::new(),
    };
    let (labels, leftovers) = parse_selections(q, &raw_items, limit);
    if !labels.is_empty() {
        return labels;
    }

    let mut free_text: Vec<String> = leftovers;
    if let Some(extra) = escape_text {
        free_text.push(extra);
    }
    let free_text = free_text.join(", ");
    if free_text.trim().is_empty() {
        return Vec::new();
    }

    let scored = top_keyword_labels(q, &free_text, limit);
    if !scored.is_empty() {
        return scored.into_iter().map(str::to_string).collect();
    }
    if let Some(other) = q.other_label.as_ref() {
        *captured = Some(free_text);
        return vec![other.clone()];
    }
    Vec::new()
}

fn resolve_bool(key: &str, raw: Option<&AnswerValue>, candidate: &NormalizationCandidate) -> bool {
    match raw {
        Some(AnswerValue::Flag(b)) => *b,
        Some(AnswerValue::Text(s)) => is_affirmative(s),
        Some(AnswerValue::List(items)) => items.first().map(|s| is_affirmative(s)).unwrap_or(false),
        None => match candidate.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(_) => candidate.text(key).map(|s| is_affirmative(&s)).unwrap_or(false),
            None => false,
        },
    }
}

fn resolve_text(key: &str, raw: Option<&AnswerValue>, candidate: &NormalizationCandidate) -> String {
    raw.map(AnswerValue::as_text)
        .or_else(|| candidate.text(key))
        .unwrap_or_default()
}

fn respondent_name(
    answers: &BTreeMap<String, PayloadValue>,
    raw: &BTreeMap<String, AnswerValue>,
    meta: &ClosureMeta,
) -> String {
    let text_of = |key: &str| -> Option<String> {
        match answers.get(key) {
            Some(PayloadValue::Text(s)) => Some(s.trim().to_string()),
            _ => raw.get(key).map(|v| v.as_text().trim().to_string()),
        }
        .filter(|s| !s.is_empty())
    };
    text_of(&meta.name_field)
        .or_else(|| text_of(&meta.email_field).and_then(|e| name_from_email(&e)))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

/// "jean-marc.dupont+audit@example.fr" -> "Jean-Marc Dupont".
pub fn name_from_email(email: &str) -> Option<String> {
    let local = email.trim().split('@').next()?;
    let local = local.split('+').next().unwrap_or(local);
    let words: Vec<String> = local
        .split(['.', '_'])
        .filter(|w| w.chars().any(char::is_alphabetic))
        .map(|w| {
            w.split('-')
                .map(capitalize)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(kind: QuestionKind, options: &[&str]) -> QuestionSchema {
        QuestionSchema {
            id: "q".into(),
            prompt: "?".into(),
            kind,
            options: options.iter().map(|s| s.to_string()).collect(),
            other_label: None,
            other_field: None,
            max_selections: None,
            maturity_scale: false,
            keywords: BTreeMap::new(),
        }
    }

    #[test]
    fn direct_match_steps() {
        let q = question(QuestionKind::SingleSelect, &["Analyse de données", "Autre chose"]);
        assert_eq!(direct_match(&q, "Analyse de données").as_deref(), Some("Analyse de données"));
        assert_eq!(direct_match(&q, " 2 ").as_deref(), Some("Autre chose"));
        assert_eq!(direct_match(&q, "analyse de DONNEES").as_deref(), Some("Analyse de données"));
        assert_eq!(direct_match(&q, "3"), None);
        assert_eq!(direct_match(&q, ""), None);
    }

    #[test]
    fn nearest_option_uses_overlap_before_default() {
        let q = question(QuestionKind::SingleSelect, &["Petite équipe", "Grande entreprise"]);
        assert_eq!(nearest_option(&q, "une grande boite"), "Grande entreprise");
    }

    #[test]
    fn multi_select_splits_conjunctions_but_keeps_labels_with_et() {
        let q = question(
            QuestionKind::MultiSelect,
            &["Service client", "Marketing et contenu", "Analyse de données"],
        );
        let (labels, leftovers) = parse_selections(
            &q,
            &["Marketing et contenu, 1 et 3".to_string()],
            usize::MAX,
        );
        assert_eq!(labels, vec!["Marketing et contenu", "Service client", "Analyse de données"]);
        assert!(leftovers.is_empty());
    }

    #[test]
    fn multi_select_space_separated_indexes() {
        let q = question(QuestionKind::MultiSelect, &["a", "b", "c"]);
        let (labels, _) = parse_selections(&q, &["3 1 3".to_string()], usize::MAX);
        assert_eq!(labels, vec!["c", "a"]);
    }

    #[test]
    fn name_derivation_from_email() {
        assert_eq!(
            name_from_email("jean-marc.dupont+audit@example.fr").as_deref(),
            Some("Jean-Marc Dupont")
        );
        assert_eq!(name_from_email("1234@example.fr"), None);
    }

    #[test]
    fn boolean_prefers_raw_then_candidate() {
        let candidate = NormalizationCandidate::from_model_text(r#"{"q": true}"#).unwrap();
        assert!(resolve_bool("q", None, &candidate));
        assert!(!resolve_bool("q", Some(&AnswerValue::Text("non".into())), &candidate));
        assert!(resolve_bool("q", Some(&AnswerValue::Text("Oui, bien sûr".into())), &candidate));
    }
}
