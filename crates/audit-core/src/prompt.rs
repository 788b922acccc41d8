//! System instructions for the conversational model, generated from the catalogue.

use crate::schema::{Catalogue, QuestionKind};
use crate::tool_call::{RECORD_ANSWER, TECHNICAL_CLOSURE};
use std::fmt::Write;

/// Marker prefixing synthetic events injected into the conversation.
pub const SYSTEM_MARKER: &str = "[SYSTEM]";

/// Silence escalations tolerated before the model must close the interview.
pub const MAX_SILENCE_ERRORS: u32 = 3;

pub fn start_event(question_id: &str) -> String {
    format!("{SYSTEM_MARKER} START question_id={question_id}")
}

pub fn resume_event(question_id: &str) -> String {
    format!("{SYSTEM_MARKER} RESUME question_id={question_id}")
}

pub fn silence_event(error_count: u32) -> String {
    format!("{SYSTEM_MARKER} SILENCE error_count={error_count}")
}

pub fn system_instruction(catalogue: &Catalogue) -> String {
    let mut out = String::new();
    out.push_str(
        "Tu es un auditeur bienveillant qui mène un entretien oral de maturité IA. \
Pose les questions une par une, dans l'ordre, en reformulant naturellement. \
Ne lis jamais les identifiants techniques à voix haute.\n\n",
    );
    let _ = writeln!(
        out,
        "Après chaque réponse, appelle `{RECORD_ANSWER}` avec questionId et la réponse \
(value, ou multiValues pour les choix multiples, otherFreeText pour « autre »), puis passe à la question suivante."
    );
    let _ = writeln!(
        out,
        "Les messages commençant par {SYSTEM_MARKER} viennent du système: START indique la question de départ, \
RESUME la question où reprendre, SILENCE signale un silence prolongé avec error_count. \
Si error_count atteint {MAX_SILENCE_ERRORS} ou si la conversation ne peut plus continuer, \
remercie la personne et appelle `{TECHNICAL_CLOSURE}`.\n"
    );
    out.push_str("Questions:\n");
    for (i, q) in catalogue.questions().iter().enumerate() {
        let _ = write!(out, "{}. [{}] {} ({})", i + 1, q.id, q.prompt, q.kind.as_str());
        if !q.options.is_empty() {
            let _ = write!(out, " options: {}", q.options.join(" | "));
        }
        if let Some(other) = &q.other_label {
            let _ = write!(out, " | {other} (préciser)");
        }
        if q.kind == QuestionKind::MultiSelect {
            if let Some(max) = q.max_selections {
                let _ = write!(out, ", {max} choix maximum");
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_lists_every_question_in_order() {
        let catalogue = Catalogue::builtin().unwrap();
        let text = system_instruction(&catalogue);
        let mut last = 0;
        for q in catalogue.questions() {
            let pos = text.find(&format!("[{}]", q.id)).unwrap();
            assert!(pos > last);
            last = pos;
        }
        assert!(text.contains(RECORD_ANSWER));
        assert!(text.contains(TECHNICAL_CLOSURE));
    }

    #[test]
    fn synthetic_events_carry_marker() {
        assert_eq!(start_event("email"), "[SYSTEM] START question_id=email");
        assert_eq!(resume_event("has_dpo"), "[SYSTEM] RESUME question_id=has_dpo");
        assert_eq!(silence_event(2), "[SYSTEM] SILENCE error_count=2");
    }
}
