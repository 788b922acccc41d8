//! Keyword-pattern scoring used when an answer matches no option literally.
//!
//! Maturity-scale questions share a positional policy: option 0 is "no maturity", the
//! last option is "full maturity", and each level has its own keyword bucket. Other
//! questions may declare per-option `keywords` in the catalogue. The keyword sets are
//! policy, not contract: tune them through [`ScoringPolicy`] or the catalogue file.

use super::text::{contains_pattern, fold};
use crate::schema::QuestionSchema;

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Keyword buckets for maturity-scale questions, lowest level first.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    maturity_levels: Vec<Vec<String>>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            maturity_levels: vec![
                patterns(&[
                    "aucun", "rien", "pas de strategie", "pas du tout", "jamais", "inexistant",
                    "rien deploye", "rien mis en place", "rien en place", "pas deploye", "pas encore",
                    "none", "nothing", "no strategy", "never", "nothing deployed", "not yet",
                ]),
                patterns(&[
                    "test", "experiment", "essai", "pilote", "poc", "preuve de concept",
                    "petite echelle", "un peu", "quelques", "ponctuel", "debut", "commenc",
                    "explor", "small scale", "trial", "proof of concept",
                ]),
                patterns(&[
                    "deploy", "deploie", "deploiement", "mise en oeuvre", "en cours", "processus",
                    "process", "formalis", "generalis", "toute l organisation", "a l echelle",
                    "plusieurs equipes", "politique", "rolled out", "organisation wide",
                    "organization wide",
                ]),
                patterns(&[
                    "strategique", "au coeur", "coeur de metier", "pilier", "integr",
                    "transformation", "mesur", "kpi", "strategic", "embedded", "fully",
                ]),
            ],
        }
    }
}

impl ScoringPolicy {
    pub fn with_maturity_levels(levels: Vec<Vec<String>>) -> Self {
        Self {
            maturity_levels: levels,
        }
    }

    /// Patterns for each option of a maturity-scale question, in option order.
    fn maturity_buckets<'q>(&self, question: &'q QuestionSchema) -> Vec<(&'q str, Vec<String>)> {
        let n = question.options.len();
        let levels = self.maturity_levels.len();
        question
            .options
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let level = if n <= 1 || levels == 0 {
                    0
                } else {
                    ((i * (levels - 1)) as f64 / (n - 1) as f64).round() as usize
                };
                let mut bucket = self.maturity_levels.get(level).cloned().unwrap_or_default();
                if let Some(extra) = question.keywords.get(label) {
                    bucket.extend(extra.iter().cloned());
                }
                (label.as_str(), bucket)
            })
            .collect()
    }

    /// Best option for free text on a maturity-scale question, if any bucket scores.
    /// Ties go to the more mature option.
    pub fn best_maturity<'q>(&self, question: &'q QuestionSchema, text: &str) -> Option<&'q str> {
        let folded = fold(text);
        self.maturity_buckets(question)
            .into_iter()
            .enumerate()
            .map(|(i, (label, bucket))| (score(&folded, &bucket), i, label))
            .filter(|(s, _, _)| *s > 0)
            .max_by_key(|(s, i, _)| (*s, *i))
            .map(|(_, _, label)| label)
    }
}

/// Labels whose catalogue keywords match `text`, best score first, at most `limit`.
pub fn top_keyword_labels<'q>(question: &'q QuestionSchema, text: &str, limit: usize) -> Vec<&'q str> {
    if question.keywords.is_empty() || limit == 0 {
        return Vec::new();
    }
    let folded = fold(text);
    let mut scored: Vec<(usize, usize, &'q str)> = question
        .allowed_labels()
        .into_iter()
        .enumerate()
        .filter_map(|(i, label)| {
            let bucket = question.keywords.get(label)?;
            let s = score(&folded, bucket);
            (s > 0).then_some((s, i, label))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(limit).map(|(_, _, label)| label).collect()
}

/// Sum of matched pattern weights; multi-word patterns weigh more.
fn score(folded_text: &str, bucket: &[String]) -> usize {
    bucket
        .iter()
        .filter(|p| contains_pattern(folded_text, p))
        .map(|p| fold(p).split(' ').count())
        .sum()
}
