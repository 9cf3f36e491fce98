//! CLI binary for the concierge kiosk.

use clap::{Parser, Subcommand};
use concierge::audio::capture::CpalCapture;
use concierge::audio::playback::{AudioSink, CpalPlayback, WavDirSink};
use concierge::audio::replay::WavReplaySource;
use concierge::knowledge::PassageIndex;
use concierge::llm::ResponseGenerator;
use concierge::tts::SpeechSynthesizer;
use concierge::{DialogueOrchestrator, KioskConfig, RuntimeEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Concierge: a spoken-dialogue hotel kiosk.
#[derive(Parser)]
#[command(name = "concierge", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the kiosk on the microphone and speakers until Ctrl+C.
    Run,

    /// Answer one typed question and speak the reply.
    Ask {
        /// The question, as the visitor would say it.
        question: String,

        /// Write the reply as WAV into this directory instead of playing it.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Feed a recorded WAV file through the full turn-taking pipeline.
    Replay {
        /// Recording to replay.
        wav: PathBuf,

        /// Directory for reply WAV files (default: play on speakers).
        #[arg(long)]
        out: Option<PathBuf>,

        /// Pace frames at capture speed.
        #[arg(long)]
        realtime: bool,
    },

    /// List available audio devices.
    Devices,

    /// Show which providers and knowledge are configured.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal in production.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let default_filter = if config.debug {
        "concierge=debug"
    } else {
        "concierge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    config.validate()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_kiosk(config).await,
        Command::Ask { question, out } => ask(config, &question, out).await,
        Command::Replay { wav, out, realtime } => replay(config, &wav, out, realtime).await,
        Command::Devices => list_devices(),
        Command::Check => check(&config),
    }
}

/// File (explicit or default path), then environment.
fn load_config(path: Option<&Path>) -> anyhow::Result<KioskConfig> {
    let mut config = match path {
        Some(path) => KioskConfig::from_file(path)?,
        None => {
            let default = KioskConfig::default_config_path();
            if default.is_file() {
                KioskConfig::from_file(&default)?
            } else {
                KioskConfig::default()
            }
        }
    };
    config.apply_env()?;
    Ok(config)
}

fn sink_for(config: &KioskConfig, out: Option<PathBuf>) -> anyhow::Result<Box<dyn AudioSink>> {
    let sink: Box<dyn AudioSink> = match out {
        Some(dir) => Box::new(WavDirSink::new(dir)?),
        None => Box::new(CpalPlayback::new(&config.audio)?),
    };
    Ok(sink)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });
    cancel
}

/// Print the conversation as it happens.
fn print_conversation(orchestrator: &DialogueOrchestrator) {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RuntimeEvent::Transcript { text, .. }) => println!("visitor > {text}"),
                Ok(RuntimeEvent::Reply { text, .. }) => println!("kiosk   > {text}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_kiosk(config: KioskConfig) -> anyhow::Result<()> {
    println!("Concierge v{}", env!("CARGO_PKG_VERSION"));

    let sink = sink_for(&config, None)?;
    let mut orchestrator = DialogueOrchestrator::from_config(&config, sink)?;
    let source = CpalCapture::new(&config.audio)?;
    let cancel = shutdown_on_ctrl_c();
    print_conversation(&orchestrator);

    println!("\nReady! Speak into the microphone. Press Ctrl+C to stop.\n");
    orchestrator.run(Box::new(source), cancel).await?;

    info!(
        turns = orchestrator.session().history().len(),
        "session ended"
    );
    Ok(())
}

async fn ask(config: KioskConfig, question: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    let sink = sink_for(&config, out)?;
    let mut orchestrator = DialogueOrchestrator::from_config(&config, sink)?;
    let turn = orchestrator.process_text(question).await;
    println!("{}", turn.reply);
    Ok(())
}

async fn replay(
    config: KioskConfig,
    wav: &Path,
    out: Option<PathBuf>,
    realtime: bool,
) -> anyhow::Result<()> {
    // Enough trailing silence for the last turn to time out.
    let tail = Duration::from_millis(u64::from(config.segmenter.silence_timeout_ms) + 500);
    let source = WavReplaySource::open(wav, &config.audio, tail, realtime)?;

    let sink = sink_for(&config, out)?;
    let mut orchestrator = DialogueOrchestrator::from_config(&config, sink)?;
    let cancel = shutdown_on_ctrl_c();
    print_conversation(&orchestrator);

    orchestrator.run(Box::new(source), cancel).await?;

    let turns = orchestrator.session().history();
    println!("\n{} turn(s)", turns.len());
    for turn in turns {
        println!(
            "  {:?}: {} ms total ({} ms before generation){}",
            turn.status,
            turn.latencies.total().as_millis(),
            turn.latencies.before_generation().as_millis(),
            if turn.synthesis_degraded { ", local voice" } else { "" },
        );
    }
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}

fn check(config: &KioskConfig) -> anyhow::Result<()> {
    println!(
        "Transcription: {} ({} model, language {})",
        config.transcription.api_url, config.transcription.model, config.transcription.language
    );

    let generator = ResponseGenerator::from_config(&config.generation);
    if generator.is_empty() {
        println!("Generation:    none configured");
    } else {
        println!("Generation:    {}", generator.provider_names().join(" -> "));
    }

    let synthesizer = SpeechSynthesizer::from_config(&config.synthesis);
    println!(
        "Synthesis:     {} -> local",
        synthesizer.primary_name().unwrap_or("(no primary)")
    );

    println!(
        "Intents:       {}",
        if config.intents.enabled {
            "greetings and desk requests answered from scripts"
        } else {
            "off (everything goes to generation)"
        }
    );

    let index = PassageIndex::load_or_empty(&config.retrieval);
    println!("Knowledge:     {} passage(s)", index.len());

    if generator.is_empty() {
        anyhow::bail!("no generation provider has a credential; set GOOGLE_API_KEY or OPENAI_API_KEY");
    }
    Ok(())
}
