use anyhow::{Context, Result};
use botstream::analytics::TracingErrorSink;
use botstream::audio::FileAudioBackend;
use botstream::bot::{
    AudioStreamRequest, BotClient, BotSessionOrchestrator, Notification, ProcessedIds,
    SessionEvent, SessionState, WebSearchQuery,
};
use botstream::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "botstream")]
#[command(about = "Talk to a streaming bot backend: web search, spoken answers, voice chat", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the web search bot and stream its answer
    WebSearch {
        #[arg(long)]
        room: String,
        /// Event id of the message that carried the question
        #[arg(long)]
        event: String,
        #[arg(long)]
        question_id: String,
        #[arg(long)]
        question: String,
    },
    /// Run one spoken-answer exchange and write the audio to a file
    Ask {
        #[arg(long)]
        room: String,
        /// Event id of the posted question
        #[arg(long)]
        event: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        query: String,
        /// Raw PCM16 output file
        #[arg(short, long, default_value = "answer.pcm")]
        out: PathBuf,
    },
    /// Duplex voice chat with file-backed audio until Ctrl-C
    VoiceChat {
        /// Raw PCM16 mono file used as the microphone
        #[arg(long)]
        capture: PathBuf,
        /// Raw PCM16 output file for the bot's voice
        #[arg(short, long, default_value = "voice-chat.pcm")]
        out: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::WebSearch {
            room,
            event,
            question_id,
            question,
        } => {
            let query = WebSearchQuery {
                room_id: Some(room),
                event_id: Some(event),
                question_id: Some(question_id),
                raw_question: Some(question),
            };
            web_search(config, query).await?;
        }
        Commands::Ask {
            room,
            event,
            user,
            query,
            out,
        } => {
            let request = AudioStreamRequest {
                query,
                event_id: event,
                user_id: user,
            };
            ask(config, room, request, out).await?;
        }
        Commands::VoiceChat { capture, out } => voice_chat(config, capture, out).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("botstream=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn web_search(config: Config, query: WebSearchQuery) -> Result<()> {
    let processed = Arc::new(ProcessedIds::new(config.bot.dedup_retention()));
    let client = BotClient::new(config.bot, processed).context("Failed to build HTTP client")?;

    let mut printed_links = false;
    let result = client
        .web_search(&query, |update| {
            if !printed_links && !update.links.is_empty() {
                println!("Sources:");
                for link in &update.links {
                    println!("  {link}");
                }
                printed_links = true;
            }
            if !update.answer.is_empty() {
                println!("---\n{}", update.answer.text);
            }
        })
        .await?;

    if !result.answer.links.is_empty() {
        println!("Links:");
        for span in &result.answer.links {
            println!("  {} -> {}", result.answer.span_text(span), span.url);
        }
    }
    Ok(())
}

async fn ask(config: Config, room_id: String, request: AudioStreamRequest, out: PathBuf) -> Result<()> {
    let backend = FileAudioBackend {
        capture_path: None,
        playback_path: out.clone(),
    };
    let (orchestrator, mut notifications) =
        BotSessionOrchestrator::new(config, Arc::new(backend), Arc::new(TracingErrorSink))?;

    orchestrator
        .handle(SessionEvent::Start { room_id, request })
        .await;
    report_until(&mut notifications, is_idle).await;

    println!("Audio written to {}", out.display());
    Ok(())
}

async fn voice_chat(config: Config, capture: PathBuf, out: PathBuf) -> Result<()> {
    if !capture.exists() {
        anyhow::bail!("Capture file {} does not exist", capture.display());
    }
    let backend = FileAudioBackend {
        capture_path: Some(capture),
        playback_path: out,
    };
    let (orchestrator, mut notifications) =
        BotSessionOrchestrator::new(config, Arc::new(backend), Arc::new(TracingErrorSink))?;

    orchestrator.handle(SessionEvent::Connect).await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                orchestrator.handle(SessionEvent::Exit).await;
                report_until(&mut notifications, is_exited).await;
                break;
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                let done = is_idle(&notification);
                report(&notification);
                if done {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn is_idle(notification: &Notification) -> bool {
    *notification == Notification::StateChanged(SessionState::Idle)
}

fn is_exited(notification: &Notification) -> bool {
    *notification == Notification::Exited
}

/// Print notifications up to and including the first one matching `done`.
async fn report_until(
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    done: fn(&Notification) -> bool,
) {
    while let Some(notification) = notifications.recv().await {
        let finished = done(&notification);
        report(&notification);
        if finished {
            break;
        }
    }
}

fn report(notification: &Notification) {
    match notification {
        Notification::StateChanged(state) => tracing::debug!(state = state.as_str(), "State"),
        Notification::Toast { message, .. } => eprintln!("! {message}"),
        Notification::BotText(text) => println!("{text}"),
        Notification::PlaybackStarted => eprintln!("[bot speaking]"),
        Notification::PlaybackFinished => eprintln!("[bot silent]"),
        Notification::PermissionRequired => eprintln!("! Microphone permission required"),
        Notification::WebSearch(result) => println!("{}", result.answer.text),
        Notification::Exited => eprintln!("Bye"),
    }
}
