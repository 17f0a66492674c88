use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use voicecall_bridge::audio_capture::{default_input_device_info, list_input_devices};
use voicecall_bridge::capture::amp_to_dbfs;
use voicecall_bridge::{
    BridgeSettings, CallBridge, CallPhase, CallStatus, DeviceAudioBackend, GeminiLiveConnector,
};

#[derive(Parser)]
#[command(name = "voicecall", version, about = "Talk to a persona over the Gemini Live API")]
struct Cli {
    /// Settings file (defaults to <config dir>/voicecall/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the configured personas
    Personas,
    /// List audio input devices
    Devices,
    /// Start a call with a persona
    Call {
        /// Persona id, e.g. "tutor"
        persona: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    voicecall_bridge::init_logging();
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => BridgeSettings::load_from(path),
        None => BridgeSettings::load(),
    };
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Personas => {
            for persona in &settings.personas {
                println!("{:<14} {:<22} voice {}", persona.id, persona.display_name, persona.voice);
            }
            ExitCode::SUCCESS
        }
        Command::Devices => {
            match default_input_device_info() {
                Some(info) => println!(
                    "default: {} ({} Hz, {} ch)",
                    info.name, info.sample_rate, info.channels
                ),
                None => println!("default: none"),
            }
            for name in list_input_devices() {
                println!("  {}", name);
            }
            ExitCode::SUCCESS
        }
        Command::Call { persona } => run_call(settings, &persona).await,
    }
}

async fn run_call(settings: BridgeSettings, persona_id: &str) -> ExitCode {
    let Some(api_key) = settings.effective_api_key() else {
        eprintln!("error: no API key; set GEMINI_API_KEY or api_key in the settings file");
        return ExitCode::FAILURE;
    };

    let connector =
        GeminiLiveConnector::new(api_key).with_endpoint(settings.live_endpoint.clone());
    let backend = DeviceAudioBackend::new(settings.input_device_name.clone());
    let bridge = CallBridge::new(settings, Arc::new(backend), Arc::new(connector));

    let call_id = match bridge.start_call(persona_id) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("call {} connecting... (m = mute, s = status, q = hang up)", call_id);

    let mut status_rx = bridge.subscribe();
    let mut last_shown = status_line(&status_rx.borrow_and_update());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut failed = false;

    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                let line = status_line(&status);
                if line != last_shown {
                    println!("{}", line);
                    last_shown = line;
                }
                if status.phase == CallPhase::NoCall {
                    if let Some(e) = &status.last_error {
                        eprintln!("call failed: {}", e);
                        failed = true;
                    }
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(cmd)) => match cmd.trim() {
                        "m" => {
                            let muted = bridge.toggle_mute();
                            println!("{}", if muted { "muted" } else { "unmuted" });
                        }
                        "s" => print_details(&bridge.status()),
                        "q" => break,
                        "" => {}
                        other => println!("unknown command '{}'", other),
                    },
                    // stdin closed
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Cli: failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }

    bridge.end_call_and_wait().await;

    if let Some(record) = bridge.call_log().into_iter().find(|r| r.id == call_id) {
        println!(
            "call {:?}: sent {} chunks, received {} chunks, {} ms",
            record.outcome,
            record.chunks_sent,
            record.chunks_received,
            record.total_duration_ms.unwrap_or(0)
        );
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn status_line(status: &CallStatus) -> String {
    format!(
        "[{:?}] {:?}{}",
        status.phase,
        status.connection,
        if status.muted { " (muted)" } else { "" }
    )
}

fn print_details(status: &CallStatus) {
    println!(
        "{} | level {:.1} dBFS | sent {} | received {} | playback failures {}",
        status_line(status),
        amp_to_dbfs(status.level.rms),
        status.chunks_sent,
        status.chunks_received,
        status.playback_failures
    );
}
