//! # Audit Voice - Live Interview Runtime
//!
//! Duplex audio with the live model and the single event loop that turns its events
//! into interview state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Interview Engine                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   Audio In   │→ │ Frame Assem. │→ │ Live Channel │      │
//! │  │    (cpal)    │  │ (16k, 1024)  │  │ (websocket)  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                                             ↓               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Audio Out   │← │  Scheduler   │← │ Event Queue  │      │
//! │  │   (rodio)    │  │  (gapless)   │  │ tools/turns  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod channel;
pub mod engine;
pub mod error;
pub mod playback;
pub mod turn;

pub use audio::{AudioBackend, CaptureConfig, CaptureHandle, DeviceBackend, FrameAssembler, PlaybackSink};
pub use channel::{connect, LiveChannel, LiveConnection, LiveEvent, LiveSetup};
pub use engine::{AudioIo, EngineConfig, EngineExit, EngineHandle, EngineInput, InterviewEngine};
pub use error::{VoiceError, VoiceResult};
pub use playback::{Playback, PlaybackScheduler, ScheduledChunk};
pub use turn::{SilenceElapsed, SilenceTimer, TurnConfig, TurnOutcome, TurnSupervisor};
