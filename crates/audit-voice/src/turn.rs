//! Turn aggregation and silence supervision
//!
//! Partial transcriptions accumulate per direction until the model signals turn
//! completion. The supervisor also owns the misunderstanding counter that drives
//! silence escalation: it grows when the silence window elapses or the model apologizes
//! for not understanding, and resets when the user says something real.

use audit_core::normalize::text::{alnum_len, contains_pattern, fold};
use audit_core::{Role, TranscriptEntry};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Shortest user utterance (alphanumeric characters) that counts as an answer.
const MIN_UTTERANCE_CHARS: usize = 3;

/// Model phrasings that mean "I did not understand you".
const APOLOGY_PATTERNS: &[&str] = &[
    "je n ai pas compris",
    "je n ai pas bien compris",
    "pas bien compris",
    "pas bien entendu",
    "pouvez vous repeter",
    "pourriez vous repeter",
    "didn t understand",
    "did not understand",
    "didn t catch",
    "did not catch",
    "could you repeat",
    "can you repeat",
];

/// Turn supervisor configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Inactivity before a silence escalation (default: 10s)
    pub silence_window: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_window: Duration::from_secs(10),
        }
    }
}

/// Result of closing a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Transcript entries to append, user first.
    pub entries: Vec<TranscriptEntry>,
    /// New error count when the turn changed it.
    pub error_count: Option<u32>,
}

/// Fired by the [`SilenceTimer`] when the window elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilenceElapsed {
    pub session_id: String,
    pub generation: u64,
}

pub fn is_apology(text: &str) -> bool {
    let folded = fold(text);
    APOLOGY_PATTERNS.iter().any(|p| contains_pattern(&folded, p))
}

#[derive(Debug, Default)]
pub struct TurnSupervisor {
    user_buffer: String,
    model_buffer: String,
    error_count: u32,
    generation: u64,
}

impl TurnSupervisor {
    pub fn new(error_count: u32) -> Self {
        Self {
            error_count,
            ..Self::default()
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn push_input(&mut self, fragment: &str) {
        self.user_buffer.push_str(fragment);
    }

    pub fn push_output(&mut self, fragment: &str) {
        self.model_buffer.push_str(fragment);
    }

    /// Start a new silence window; earlier timers become stale.
    pub fn rearm(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Flush both buffers into transcript entries and update the error counter.
    pub fn complete_turn(&mut self, at: DateTime<Utc>) -> TurnOutcome {
        let user = std::mem::take(&mut self.user_buffer).trim().to_string();
        let model = std::mem::take(&mut self.model_buffer).trim().to_string();
        let before = self.error_count;

        if alnum_len(&user) >= MIN_UTTERANCE_CHARS {
            self.error_count = 0;
        }
        if is_apology(&model) {
            self.error_count += 1;
        }

        let mut entries = Vec::with_capacity(2);
        if !user.is_empty() {
            entries.push(TranscriptEntry {
                role: Role::User,
                text: user,
                at,
            });
        }
        if !model.is_empty() {
            entries.push(TranscriptEntry {
                role: Role::Model,
                text: model,
                at,
            });
        }
        TurnOutcome {
            entries,
            error_count: (self.error_count != before).then_some(self.error_count),
        }
    }

    /// Accept a timer firing. Returns the incremented count, or `None` when stale.
    pub fn on_silence(&mut self, generation: u64) -> Option<u32> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "stale silence timer ignored");
            return None;
        }
        self.error_count += 1;
        Some(self.error_count)
    }
}

/// Cancellable single-shot timer; rearming aborts the previous one.
#[derive(Debug, Default)]
pub struct SilenceTimer {
    task: Option<JoinHandle<()>>,
}

impl SilenceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rearm<T>(&mut self, window: Duration, tick: SilenceElapsed, tx: mpsc::UnboundedSender<T>)
    where
        T: From<SilenceElapsed> + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(T::from(tick));
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_flushes_user_then_model() {
        let mut s = TurnSupervisor::new(0);
        s.push_output("Quelle est ");
        s.push_input("Bonjour, ");
        s.push_output("votre taille ?");
        s.push_input("je suis là");
        let outcome = s.complete_turn(Utc::now());
        let roles: Vec<Role> = outcome.entries.iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Model]);
        assert_eq!(outcome.entries[0].text, "Bonjour, je suis là");
        assert_eq!(outcome.entries[1].text, "Quelle est votre taille ?");

        let empty = s.complete_turn(Utc::now());
        assert!(empty.entries.is_empty());
    }

    #[test]
    fn real_utterance_resets_counter_and_noise_does_not() {
        let mut s = TurnSupervisor::new(2);
        s.push_input("euh");
        assert_eq!(s.complete_turn(Utc::now()).error_count, Some(0));

        let mut s = TurnSupervisor::new(2);
        s.push_input(" .. ");
        assert_eq!(s.complete_turn(Utc::now()).error_count, None);
        assert_eq!(s.error_count(), 2);
    }

    #[test]
    fn apology_increments_counter() {
        let mut s = TurnSupervisor::new(0);
        s.push_output("Désolé, je n'ai pas bien compris. Pouvez-vous répéter ?");
        assert_eq!(s.complete_turn(Utc::now()).error_count, Some(1));
        assert!(is_apology("Sorry, I didn't catch that"));
        assert!(!is_apology("Parfait, question suivante."));
    }

    #[test]
    fn stale_silence_is_ignored() {
        let mut s = TurnSupervisor::new(0);
        let old = s.rearm();
        let current = s.rearm();
        assert_eq!(s.on_silence(old), None);
        assert_eq!(s.on_silence(current), Some(1));
        assert_eq!(s.on_silence(current), Some(2));
    }

    #[derive(Debug, PartialEq)]
    struct Wrapped(SilenceElapsed);

    impl From<SilenceElapsed> for Wrapped {
        fn from(e: SilenceElapsed) -> Self {
            Wrapped(e)
        }
    }

    #[tokio::test]
    async fn rearm_cancels_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Wrapped>();
        let mut timer = SilenceTimer::new();
        let tick = |generation| SilenceElapsed {
            session_id: "s".into(),
            generation,
        };
        timer.rearm(Duration::from_millis(20), tick(1), tx.clone());
        timer.rearm(Duration::from_millis(40), tick(2), tx.clone());
        assert!(timer.is_armed());
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired, Wrapped(tick(2)));

        timer.rearm(Duration::from_millis(20), tick(3), tx.clone());
        timer.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
