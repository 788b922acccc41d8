//! Question catalogue: the immutable schema an interview is conducted against.
//!
//! The catalogue is loaded once (TOML file or the built-in default) and shared read-only
//! by the state machine, the dispatcher and the normalization engine.

use crate::error::{AuditError, AuditResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const DEFAULT_CATALOGUE: &str = include_str!("../catalogue/default.toml");

/// Answer shape of a question; selects the normalization routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleSelect,
    MultiSelect,
    FreeText,
    Boolean,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::SingleSelect => "single_select",
            QuestionKind::MultiSelect => "multi_select",
            QuestionKind::FreeText => "free_text",
            QuestionKind::Boolean => "boolean",
        }
    }
}

/// One catalogued question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSchema {
    pub id: String,
    pub prompt: String,
    pub kind: QuestionKind,
    /// Allowed option labels, in presentation order.
    #[serde(default)]
    pub options: Vec<String>,
    /// Escape option ("other"). May or may not also appear in `options`.
    #[serde(default)]
    pub other_label: Option<String>,
    /// Answer key holding the free text that goes with `other_label`.
    #[serde(default)]
    pub other_field: Option<String>,
    /// Upper bound on selections (multi-select only).
    #[serde(default)]
    pub max_selections: Option<usize>,
    /// Options are ordered from no maturity to full maturity.
    #[serde(default)]
    pub maturity_scale: bool,
    /// Option label -> keyword patterns used by the scoring fallback.
    #[serde(default)]
    pub keywords: BTreeMap<String, Vec<String>>,
}

impl QuestionSchema {
    /// Every label a closed answer may take: the options plus the escape label.
    pub fn allowed_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.options.iter().map(String::as_str).collect();
        if let Some(other) = self.other_label.as_deref() {
            if !labels.contains(&other) {
                labels.push(other);
            }
        }
        labels
    }

    pub fn is_allowed(&self, label: &str) -> bool {
        self.allowed_labels().contains(&label)
    }

    /// Effective selection bound for multi-select questions.
    pub fn selection_limit(&self) -> usize {
        self.max_selections
            .unwrap_or(usize::MAX)
            .min(self.allowed_labels().len())
    }

    fn validate(&self) -> AuditResult<()> {
        if self.id.trim().is_empty() {
            return Err(AuditError::Catalogue("question with empty id".to_string()));
        }
        let mut seen = HashSet::new();
        for option in &self.options {
            if !seen.insert(option.as_str()) {
                return Err(AuditError::Catalogue(format!(
                    "question {}: duplicate option label {:?}",
                    self.id, option
                )));
            }
        }
        let closed = matches!(self.kind, QuestionKind::SingleSelect | QuestionKind::MultiSelect);
        if closed && self.allowed_labels().is_empty() {
            return Err(AuditError::Catalogue(format!(
                "question {}: {} requires at least one option",
                self.id,
                self.kind.as_str()
            )));
        }
        if self.other_label.is_some() != self.other_field.is_some() {
            return Err(AuditError::Catalogue(format!(
                "question {}: other_label and other_field must be declared together",
                self.id
            )));
        }
        for label in self.keywords.keys() {
            if !self.is_allowed(label) {
                return Err(AuditError::Catalogue(format!(
                    "question {}: keywords reference unknown option {:?}",
                    self.id, label
                )));
            }
        }
        if self.max_selections == Some(0) {
            return Err(AuditError::Catalogue(format!(
                "question {}: max_selections must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct CatalogueFile {
    questions: Vec<QuestionSchema>,
}

/// Ordered, validated list of questions.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalogue {
    questions: Vec<QuestionSchema>,
}

impl Catalogue {
    pub fn new(questions: Vec<QuestionSchema>) -> AuditResult<Self> {
        if questions.is_empty() {
            return Err(AuditError::Catalogue("catalogue has no questions".to_string()));
        }
        let mut keys = HashSet::new();
        for q in &questions {
            q.validate()?;
            if !keys.insert(q.id.as_str()) {
                return Err(AuditError::Catalogue(format!("duplicate question id {}", q.id)));
            }
        }
        for q in &questions {
            if let Some(field) = q.other_field.as_deref() {
                if !keys.insert(field) {
                    return Err(AuditError::Catalogue(format!(
                        "question {}: escape field {} collides with another key",
                        q.id, field
                    )));
                }
            }
        }
        Ok(Self { questions })
    }

    pub fn from_toml_str(raw: &str) -> AuditResult<Self> {
        let file: CatalogueFile = toml::from_str(raw)?;
        Self::new(file.questions)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> AuditResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Load from `path` when it exists, otherwise fall back to the built-in catalogue.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AuditResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.as_ref().display(), "catalogue file not found; using built-in catalogue");
            Self::builtin()
        }
    }

    pub fn builtin() -> AuditResult<Self> {
        Self::from_toml_str(DEFAULT_CATALOGUE)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn questions(&self) -> &[QuestionSchema] {
        &self.questions
    }

    pub fn get(&self, id: &str) -> Option<&QuestionSchema> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.questions.iter().position(|q| q.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&QuestionSchema> {
        self.questions.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(id: &str, options: &[&str]) -> QuestionSchema {
        QuestionSchema {
            id: id.to_string(),
            prompt: format!("{id}?"),
            kind: QuestionKind::SingleSelect,
            options: options.iter().map(|s| s.to_string()).collect(),
            other_label: None,
            other_field: None,
            max_selections: None,
            maturity_scale: false,
            keywords: BTreeMap::new(),
        }
    }

    #[test]
    fn builtin_catalogue_is_valid() {
        let catalogue = Catalogue::builtin().unwrap();
        assert!(catalogue.len() >= 5);
        assert!(catalogue.questions().iter().any(|q| q.maturity_scale));
    }

    #[test]
    fn duplicate_options_are_rejected() {
        let err = Catalogue::new(vec![select("q1", &["a", "a"])]).unwrap_err();
        assert!(err.to_string().contains("duplicate option"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = Catalogue::new(vec![select("q1", &["a"]), select("q1", &["b"])]).unwrap_err();
        assert!(err.to_string().contains("duplicate question id"));
    }

    #[test]
    fn escape_label_counts_as_allowed() {
        let mut q = select("q1", &["a", "b"]);
        q.other_label = Some("Autre".to_string());
        q.other_field = Some("q1_other".to_string());
        assert_eq!(q.allowed_labels(), vec!["a", "b", "Autre"]);
        assert!(Catalogue::new(vec![q]).is_ok());
    }

    #[test]
    fn positions_follow_file_order() {
        let catalogue = Catalogue::new(vec![select("q1", &["a"]), select("q2", &["b"])]).unwrap();
        assert_eq!(catalogue.position("q2"), Some(1));
        assert_eq!(catalogue.at(0).map(|q| q.id.as_str()), Some("q1"));
        assert!(catalogue.get("q3").is_none());
    }
}
