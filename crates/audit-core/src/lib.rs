//! audit-core: question catalogue, interview state machine, tool-call dispatch,
//! answer normalization and submission.
//!
//! Audio and the live model channel live in `audit-voice`; this crate has no device or
//! socket code and is fully testable in-process.

mod config;
mod error;
mod machine;
mod schema;
mod session;
mod store;
pub mod normalize;
pub mod prompt;
pub mod submission;
pub mod tool_call;

pub use config::{AuditConfig, AudioSettings, LiveSettings, MappingSettings};
pub use error::{AuditError, AuditResult};
pub use machine::{Commit, Entry, InterviewMachine, Phase};
pub use schema::{Catalogue, QuestionKind, QuestionSchema};
pub use session::{AnswerValue, Closure, InterviewSession, Role, TranscriptEntry};
pub use store::{SessionStore, SledPersistence, StoreEvent, StoreObserver, StoreSnapshot};

// Normalization
pub use normalize::{
    GuaranteedPayload, NormalizationCandidate, Normalizer, OpenAiCompatMapper, PayloadValue, ScoringPolicy,
    SemanticMapper,
};

// Submission and tool calls
pub use submission::{
    DeliveryEndpoint, SubmissionError, SubmissionOutcome, SubmissionPipeline, SubmissionState, UnconfiguredDelivery,
    WebhookDelivery,
};
pub use tool_call::{ToolAck, ToolCall, ToolCallError, ToolDispatcher, ToolInvocation};
