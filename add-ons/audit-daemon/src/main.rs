//! Voice audit daemon
//!
//! Usage:
//!   audit-daemon [interview]      Run one live interview (resumes an unfinished session)
//!   audit-daemon list             Show stored sessions
//!   audit-daemon discard <id>     Delete a session
//!   audit-daemon resubmit <id>    Deliver a finished session again (manual only)

use anyhow::{bail, Context};
use audit_core::normalize::Normalizer;
use audit_core::prompt::system_instruction;
use audit_core::{
    AuditConfig, Catalogue, DeliveryEndpoint, InterviewMachine, SessionStore, SubmissionOutcome, SubmissionPipeline,
    SubmissionState, ToolDispatcher, UnconfiguredDelivery, WebhookDelivery,
};
use audit_voice::{
    connect, AudioIo, CaptureConfig, DeviceBackend, EngineConfig, EngineInput, InterviewEngine, LiveSetup, TurnConfig,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Interview,
    List,
    Discard(String),
    Resubmit(String),
}

fn parse_command() -> anyhow::Result<Command> {
    let mut args = std::env::args().skip(1);
    let command = match args.next().as_deref() {
        None | Some("interview") => Command::Interview,
        Some("list") => Command::List,
        Some("discard") => Command::Discard(args.next().context("discard needs a session id")?),
        Some("resubmit") => Command::Resubmit(args.next().context("resubmit needs a session id")?),
        Some(other) => bail!("unknown command `{other}` (expected interview, list, discard <id>, resubmit <id>)"),
    };
    Ok(command)
}

struct Runtime {
    config: AuditConfig,
    catalogue: Arc<Catalogue>,
    machine: InterviewMachine,
    pipeline: Arc<SubmissionPipeline>,
}

impl Runtime {
    fn open(config: AuditConfig) -> anyhow::Result<Self> {
        let catalogue = Arc::new(
            Catalogue::load_or_default(&config.catalogue_path)
                .with_context(|| format!("load catalogue {}", config.catalogue_path))?,
        );
        // sled is single-writer: only one daemon per storage path.
        let store = Arc::new(
            SessionStore::open_persistent(&config.storage_path)
                .with_context(|| format!("open session store {}", config.storage_path))?,
        );
        let machine = InterviewMachine::new(store, Arc::clone(&catalogue));

        let normalizer = Normalizer::new(Arc::clone(&catalogue), config.semantic_mapper(), config.source_tag.clone())
            .with_identity_fields(config.name_field.clone(), config.email_field.clone());
        let delivery: Arc<dyn DeliveryEndpoint> = match config.webhook_url.as_deref() {
            Some(url) => Arc::new(WebhookDelivery::new(url)),
            None => {
                tracing::warn!("no webhook_url configured; finished sessions cannot be delivered");
                Arc::new(UnconfiguredDelivery)
            }
        };
        let pipeline = Arc::new(SubmissionPipeline::new(
            machine.clone(),
            normalizer,
            delivery,
            config.submission_deadline(),
            config.mapping_timeout(),
        ));

        Ok(Self {
            config,
            catalogue,
            machine,
            pipeline,
        })
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            capture: CaptureConfig {
                sample_rate: self.config.audio.capture_sample_rate,
                frame_samples: self.config.audio.frame_samples,
            },
            playback_sample_rate: self.config.audio.playback_sample_rate,
            turn: TurnConfig {
                silence_window: self.config.silence_window(),
            },
            archive_grace: self.config.archive_grace(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[audit-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = parse_command()?;
    let config = AuditConfig::load().context("load AuditConfig")?;
    let runtime = Runtime::open(config)?;

    match command {
        Command::Interview => interview(runtime).await,
        Command::List => {
            list(&runtime);
            Ok(())
        }
        Command::Discard(id) => {
            runtime.machine.store().discard(&id)?;
            println!("discarded {id}");
            Ok(())
        }
        Command::Resubmit(id) => resubmit(&runtime, &id).await,
    }
}

async fn interview(runtime: Runtime) -> anyhow::Result<()> {
    let engine_config = runtime.engine_config();
    // Devices first: a missing microphone must not leave a session behind.
    let audio = AudioIo::open(&DeviceBackend, &engine_config)?;

    let (completed_tx, completed_rx) = mpsc::unbounded_channel();
    let worker = Arc::clone(&runtime.pipeline).spawn_worker(completed_rx);
    let mut states = runtime.pipeline.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            match &*states.borrow() {
                SubmissionState::Idle => {}
                SubmissionState::Submitting => tracing::info!("submitting audit"),
                SubmissionState::Success => tracing::info!("audit delivered"),
                SubmissionState::Error(e) => tracing::error!(error = %e, "audit delivery failed"),
            }
        }
    });

    let live = &runtime.config.live;
    let setup = LiveSetup {
        model: live.model.clone(),
        system_instruction: system_instruction(&runtime.catalogue),
        voice: live.voice.clone(),
    };
    let queue = InterviewEngine::queue();
    let connection = connect(&live.url, live.api_key.as_deref(), &setup, queue.0.clone(), EngineInput::Live)
        .await
        .context("connect live channel")?;

    let dispatcher = ToolDispatcher::new(runtime.machine.clone(), completed_tx);
    let engine = InterviewEngine::new(
        runtime.machine.clone(),
        dispatcher,
        connection.channel.clone(),
        audio,
        engine_config,
        queue,
    );
    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("CTRL-C received; stopping interview");
            handle.stop();
        }
    });

    let exit = engine.run().await;
    tracing::info!(?exit, "interview ended");
    connection.join().await;

    // The dispatcher went away with the engine; the worker drains what was queued.
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "submission worker failed");
    }
    Ok(())
}

fn list(runtime: &Runtime) {
    let store = runtime.machine.store();
    let current = store.current_id();
    let total = runtime.catalogue.len();
    for session in store.list() {
        let marker = if current.as_deref() == Some(session.id.as_str()) { "*" } else { " " };
        let status = match (&session.closure, session.finished) {
            (Some(closure), _) => format!("{closure:?}").to_lowercase(),
            (None, true) => "finished".to_string(),
            (None, false) => "active".to_string(),
        };
        println!(
            "{marker} {}  {}  {}/{}  {:<9} errors={}{}",
            session.id,
            session.created_at.format("%Y-%m-%d %H:%M"),
            session.question_index.min(total),
            total,
            status,
            session.error_count,
            if session.submission_claimed { "  submitted" } else { "" },
        );
    }
}

async fn resubmit(runtime: &Runtime, id: &str) -> anyhow::Result<()> {
    match runtime.pipeline.resubmit(id).await {
        SubmissionOutcome::Delivered(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        SubmissionOutcome::Failed(e) => bail!("delivery failed: {e}"),
        SubmissionOutcome::Skipped => bail!("submission of {id} was skipped"),
    }
}
