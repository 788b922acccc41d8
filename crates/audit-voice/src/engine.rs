//! Interview engine - the main coordination layer
//!
//! One task drains one queue of [`EngineInput`]s in arrival order: live channel events,
//! silence timer firings, archive ticks and stop requests. Every state change goes
//! through the [`InterviewMachine`]; audio and the socket are side effects.
//!
//! ```text
//!  mic ──frames──▶ forwarder ──realtimeInput──▶ live channel ──▶ model
//!                                                   │
//!  speaker ◀── playback ◀── Audio ─┐                ▼
//!                                  ├──────── EngineInput queue ◀── silence timer
//!  store ◀── machine ◀── dispatcher┘                ▲
//!                                                   └── archive tick
//! ```

use crate::audio::{encode_pcm16, AudioBackend, CaptureConfig, CaptureHandle};
use crate::channel::{audio_message, LiveChannel, LiveEvent};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::Playback;
use crate::turn::{SilenceElapsed, SilenceTimer, TurnConfig, TurnSupervisor};
use audit_core::prompt::{resume_event, silence_event, start_event};
use audit_core::{Entry, InterviewMachine, ToolAck, ToolDispatcher, ToolInvocation};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the engine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Live(LiveEvent),
    Silence(SilenceElapsed),
    /// Display grace period of a finished session is over.
    Archive(String),
    Stop,
}

impl From<LiveEvent> for EngineInput {
    fn from(event: LiveEvent) -> Self {
        EngineInput::Live(event)
    }
}

impl From<SilenceElapsed> for EngineInput {
    fn from(tick: SilenceElapsed) -> Self {
        EngineInput::Silence(tick)
    }
}

/// Why the engine loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    /// The session finished and its grace period elapsed.
    Finished(String),
    ChannelClosed,
    Stopped,
}

/// Configuration for the interview engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capture: CaptureConfig,
    /// Sample rate of model audio (default: 24000)
    pub playback_sample_rate: u32,
    pub turn: TurnConfig,
    /// How long a finished session stays current (default: 5s)
    pub archive_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            playback_sample_rate: 24_000,
            turn: TurnConfig::default(),
            archive_grace: Duration::from_secs(5),
        }
    }
}

/// Opened audio devices. Built before any interview state exists.
pub struct AudioIo {
    capture: Box<dyn CaptureHandle>,
    frames: mpsc::Receiver<Vec<f32>>,
    playback: Playback,
}

impl AudioIo {
    pub fn open(backend: &dyn AudioBackend, config: &EngineConfig) -> VoiceResult<Self> {
        let (frames_tx, frames) = mpsc::channel(1);
        let mut capture = backend
            .open_capture(&config.capture, frames_tx)
            .map_err(|e| VoiceError::CannotStart(e.to_string()))?;
        let sink = match backend.open_playback(config.playback_sample_rate) {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(stop_err) = capture.stop() {
                    warn!("Capture close after failed playback open: {}", stop_err);
                }
                return Err(VoiceError::CannotStart(e.to_string()));
            }
        };
        Ok(Self {
            capture,
            frames,
            playback: Playback::new(sink, config.playback_sample_rate),
        })
    }
}

/// Cloneable way to reach a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl EngineHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(EngineInput::Stop);
    }

    pub fn send(&self, input: EngineInput) -> VoiceResult<()> {
        self.tx.send(input).map_err(|_| VoiceError::ChannelClosed)
    }
}

pub struct InterviewEngine {
    machine: InterviewMachine,
    dispatcher: ToolDispatcher,
    channel: LiveChannel,
    config: EngineConfig,

    capture: Option<Box<dyn CaptureHandle>>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    forwarder: Option<JoinHandle<()>>,
    playback: Option<Playback>,

    supervisor: TurnSupervisor,
    timer: SilenceTimer,
    archive_task: Option<JoinHandle<()>>,
    session_id: Option<String>,

    inputs: mpsc::UnboundedReceiver<EngineInput>,
    inputs_tx: mpsc::UnboundedSender<EngineInput>,
    torn_down: bool,
}

impl InterviewEngine {
    /// Input queue for a new engine; hand the sender to the live channel reader.
    pub fn queue() -> (mpsc::UnboundedSender<EngineInput>, mpsc::UnboundedReceiver<EngineInput>) {
        mpsc::unbounded_channel()
    }

    pub fn new(
        machine: InterviewMachine,
        dispatcher: ToolDispatcher,
        channel: LiveChannel,
        audio: AudioIo,
        config: EngineConfig,
        queue: (mpsc::UnboundedSender<EngineInput>, mpsc::UnboundedReceiver<EngineInput>),
    ) -> Self {
        let (inputs_tx, inputs) = queue;
        Self {
            machine,
            dispatcher,
            channel,
            config,
            capture: Some(audio.capture),
            frames: Some(audio.frames),
            forwarder: None,
            playback: Some(audio.playback),
            supervisor: TurnSupervisor::default(),
            timer: SilenceTimer::new(),
            archive_task: None,
            session_id: None,
            inputs,
            inputs_tx,
            torn_down: false,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.inputs_tx.clone(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Drain the queue until the session is archived, the channel closes or a stop arrives.
    pub async fn run(mut self) -> EngineExit {
        info!("🎙️ Interview engine running");
        let exit = loop {
            let Some(input) = self.inputs.recv().await else {
                break EngineExit::Stopped;
            };
            match self.step(input) {
                Ok(Some(exit)) => break exit,
                Ok(None) => {}
                Err(e) => warn!("Engine input failed: {}", e),
            }
        };
        self.teardown();
        info!(?exit, "Interview engine stopped");
        exit
    }

    /// Apply one input. Public so callers can drive the engine step by step.
    pub fn step(&mut self, input: EngineInput) -> VoiceResult<Option<EngineExit>> {
        match input {
            EngineInput::Live(event) => self.on_live(event),
            EngineInput::Silence(tick) => {
                self.on_silence(tick)?;
                Ok(None)
            }
            EngineInput::Archive(session_id) => {
                self.machine.archive(&session_id);
                Ok(Some(EngineExit::Finished(session_id)))
            }
            EngineInput::Stop => Ok(Some(EngineExit::Stopped)),
        }
    }

    fn on_live(&mut self, event: LiveEvent) -> VoiceResult<Option<EngineExit>> {
        match event {
            LiveEvent::SetupComplete => self.on_setup_complete()?,
            LiveEvent::Audio(data) => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.enqueue(&data, Instant::now())?;
                }
            }
            LiveEvent::Interrupted => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt(Instant::now());
                }
            }
            LiveEvent::InputTranscript(text) => {
                self.supervisor.push_input(&text);
                self.on_activity();
            }
            LiveEvent::OutputTranscript(text) => {
                self.supervisor.push_output(&text);
                self.on_activity();
            }
            LiveEvent::TurnComplete => self.on_turn_complete()?,
            LiveEvent::ToolCalls(calls) => self.on_tool_calls(&calls)?,
            LiveEvent::GoAway => info!("Live server announced disconnect"),
            LiveEvent::Closed => return Ok(Some(EngineExit::ChannelClosed)),
        }
        Ok(None)
    }

    fn on_setup_complete(&mut self) -> VoiceResult<()> {
        let entry = self.machine.enter();
        let (text, session_id) = match &entry {
            Entry::Fresh { session_id, question_id } => (start_event(question_id), session_id.clone()),
            Entry::Resume { session_id, question_id } => (resume_event(question_id), session_id.clone()),
        };
        let error_count = self
            .machine
            .store()
            .get(&session_id)
            .map(|s| s.error_count)
            .unwrap_or(0);
        self.supervisor = TurnSupervisor::new(error_count);
        self.session_id = Some(session_id);
        self.channel.send_text(&text)?;
        self.start_forwarding();
        self.rearm_silence();
        Ok(())
    }

    fn start_forwarding(&mut self) {
        let Some(mut frames) = self.frames.take() else {
            return;
        };
        let channel = self.channel.clone();
        let rate = self.config.capture.sample_rate;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if channel.send(audio_message(&encode_pcm16(&frame), rate)).is_err() {
                    break;
                }
            }
            debug!("capture forwarding ended");
        }));
    }

    /// Any transcription activity restarts the silence window.
    fn on_activity(&mut self) {
        if let Some(session_id) = self.session_id.as_deref() {
            if self.session_active(session_id) {
                self.rearm_silence();
            }
        }
    }

    fn on_turn_complete(&mut self) -> VoiceResult<()> {
        let outcome = self.supervisor.complete_turn(Utc::now());
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        self.machine.record_turns(&session_id, outcome.entries)?;
        if let Some(count) = outcome.error_count {
            debug!(session_id = %session_id, error_count = count, "error count changed");
            self.machine.set_error_count(&session_id, count)?;
        }
        if self.session_active(&session_id) {
            self.rearm_silence();
        }
        Ok(())
    }

    fn on_tool_calls(&mut self, calls: &[ToolInvocation]) -> VoiceResult<()> {
        let acks: Vec<ToolAck> = calls.iter().map(|call| self.dispatcher.dispatch(call)).collect();
        let sent = self.channel.send_tool_responses(&acks);

        if let Some(session_id) = self.session_id.clone() {
            if !self.session_active(&session_id) && self.archive_task.is_none() {
                self.timer.cancel();
                info!(session_id = %session_id, grace_ms = self.config.archive_grace.as_millis() as u64, "session finished");
                let tx = self.inputs_tx.clone();
                let grace = self.config.archive_grace;
                self.archive_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(EngineInput::Archive(session_id));
                }));
            }
        }
        sent
    }

    fn on_silence(&mut self, tick: SilenceElapsed) -> VoiceResult<()> {
        if self.session_id.as_deref() != Some(tick.session_id.as_str()) || !self.session_active(&tick.session_id) {
            return Ok(());
        }
        let Some(count) = self.supervisor.on_silence(tick.generation) else {
            return Ok(());
        };
        info!(session_id = %tick.session_id, error_count = count, "silence window elapsed");
        self.machine.set_error_count(&tick.session_id, count)?;
        self.channel.send_text(&silence_event(count))?;
        self.rearm_silence();
        Ok(())
    }

    fn session_active(&self, session_id: &str) -> bool {
        self.machine
            .store()
            .get(session_id)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    fn rearm_silence(&mut self) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        let generation = self.supervisor.rearm();
        self.timer.rearm(
            self.config.turn.silence_window,
            SilenceElapsed { session_id, generation },
            self.inputs_tx.clone(),
        );
    }

    /// Cancel the timer, close the channel, stop capture and playback. Idempotent and
    /// safe on a partially started engine.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.timer.cancel();
        if let Some(task) = self.archive_task.take() {
            task.abort();
        }
        self.channel.close();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.frames = None;
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.stop() {
                warn!("Capture close failed: {}", e);
            }
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        debug!("engine torn down");
    }
}

impl Drop for InterviewEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
