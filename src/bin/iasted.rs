//! Terminal front end for the iAsted voice session engine.
//!
//! Wires real devices and collaborators into a session and drives it from
//! stdin: one-letter commands stand in for the application's buttons.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use iasted::audio::{CpalInput, RodioOutput};
use iasted::remote::{
    ElevenLabsSynthesizer, HttpCredentialIssuer, OpenAiCompleter, OpenAiTranscriber,
};
use iasted::session::{Collaborators, SessionEvent, Transport, VoiceSession};
use iasted::{Notifier, NoticeLevel, TransportMode, TurnStrategy, VoiceConfig, VoiceState};

#[derive(Parser, Debug)]
#[command(name = "iasted", about = "Assistant vocal iAsted", version)]
struct Args {
    /// Config file (defaults to the per-user config path).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the realtime channel instead of turn-based calls.
    #[arg(long)]
    realtime: bool,

    /// Re-arm listening after each assistant reply.
    #[arg(long)]
    continuous: bool,

    /// Close turns on explicit command instead of silence detection.
    #[arg(long)]
    push_to_talk: bool,

    /// Input device name (default device when omitted).
    #[arg(long)]
    device: Option<String>,

    /// Ephemeral-credential endpoint for the realtime channel.
    #[arg(long)]
    token_endpoint: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "ELEVENLABS_API_KEY", hide_env_values = true)]
    elevenlabs_api_key: Option<String>,
}

fn build_transport(cfg: &VoiceConfig, args: &Args) -> Result<Transport> {
    match cfg.transport {
        TransportMode::RealtimeChannel => {
            let endpoint = args
                .token_endpoint
                .clone()
                .or_else(|| {
                    (!cfg.remote.token_endpoint.is_empty())
                        .then(|| cfg.remote.token_endpoint.clone())
                })
                .context("realtime mode requires --token-endpoint or remote.token_endpoint")?;
            let issuer =
                HttpCredentialIssuer::new(endpoint, None, cfg.remote.realtime_url.clone())?;
            Ok(Transport::Realtime {
                issuer: Arc::new(issuer),
            })
        }
        TransportMode::TurnBased => {
            let Some(openai_key) = args.openai_api_key.clone() else {
                bail!("OPENAI_API_KEY is required for turn-based mode");
            };
            let Some(elevenlabs_key) = args.elevenlabs_api_key.clone() else {
                bail!("ELEVENLABS_API_KEY is required for turn-based mode");
            };
            let transcriber = OpenAiTranscriber::new(
                cfg.remote.openai_base_url.clone(),
                openai_key.clone(),
                cfg.remote.transcription_model.clone(),
                Some(cfg.language.clone()),
            )?;
            let completer = OpenAiCompleter::new(
                cfg.remote.openai_base_url.clone(),
                openai_key,
                cfg.remote.chat_model.clone(),
                cfg.remote.chat_temperature,
                cfg.remote.stream_completions,
            )?;
            let synthesizer = ElevenLabsSynthesizer::new(
                cfg.remote.elevenlabs_base_url.clone(),
                elevenlabs_key,
                cfg.remote.voice_id.clone(),
                cfg.remote.tts_model.clone(),
            )?;
            Ok(Transport::TurnBased(Collaborators {
                transcriber: Arc::new(transcriber),
                completer: Arc::new(completer),
                synthesizer: Arc::new(synthesizer),
            }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cfg = VoiceConfig::load(args.config.as_deref())?;
    if args.realtime {
        cfg.transport = TransportMode::RealtimeChannel;
    }
    if args.continuous {
        cfg.continuous = true;
    }
    if args.push_to_talk {
        cfg.strategy = TurnStrategy::PushToTalk;
    }
    if args.device.is_some() {
        cfg.input_device = args.device.clone();
    }

    let transport = build_transport(&cfg, &args)?;
    let input = CpalInput::new(cfg.input_device.clone(), cfg.frame_channel_capacity);
    let output = Arc::new(RodioOutput::new()?);

    let (notifier, mut notices) = Notifier::channel();
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let marker = match notice.level {
                NoticeLevel::Info => "·",
                NoticeLevel::Warning => "!",
                NoticeLevel::Error => "✗",
            };
            println!("{marker} {}", notice.message);
        }
    });

    let session = VoiceSession::spawn(cfg, transport, Box::new(input), output, notifier);

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => {
                    if state == VoiceState::Listening {
                        println!("— à l'écoute —");
                    }
                    debug!(state = state.label(), "state");
                }
                Ok(SessionEvent::UserTurn(text)) => println!("vous : {text}"),
                Ok(SessionEvent::AssistantTurn(text)) => println!("iasted : {text}"),
                Ok(SessionEvent::Level(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    println!("commandes : [t] démarrer/arrêter  [f] envoyer le tour  [q] quitter");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "t" => session.toggle(),
                    "s" => session.start(),
                    "x" => session.stop(),
                    "f" => session.finish_turn(),
                    "q" => break,
                    "" => {}
                    other => println!("commande inconnue : {other}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}
