use clap::{Parser, Subcommand};
use crossbeam::channel;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

use juno::audio::{self, CaptureManager};
use juno::config::{AudioConfig, JunoConfig};
use juno::export;
use juno::stream::StreamServer;
use juno::{Error, Result, Sample, SoundType, Studio};

#[derive(Parser)]
#[command(name = "juno")]
#[command(about = "Play samples on a hardware synth and stream its audio")]
#[command(version)]
struct Cli {
    /// Configuration file (RON); defaults apply if it does not exist
    #[arg(short, long, default_value = "juno.ron")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List MIDI output ports
    Ports,

    /// List audio input devices
    Devices,

    /// Play a sample and wait for it to finish
    Play {
        sample: PathBuf,

        /// Also capture and serve the synth's audio while playing
        #[arg(long)]
        stream: bool,

        /// Only play layers of these sounds (bass, pad, lead)
        #[arg(long = "only", value_parser = parse_sound)]
        only: Vec<SoundType>,
    },

    /// Capture and serve the synth's audio until interrupted
    Serve,

    /// Write a sample as a MIDI file, and optionally record it to WAV
    Export {
        sample: PathBuf,

        #[arg(long)]
        midi: PathBuf,

        /// Record the synth playing the sample
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Seconds recorded after the sample ends
        #[arg(long, default_value = "1.0")]
        tail: f64,
    },

    /// Capture process body (spawned internally)
    #[command(hide = true)]
    CaptureWorker {
        /// Audio config as inline RON
        #[arg(long)]
        config: String,
    },
}

fn parse_sound(value: &str) -> std::result::Result<SoundType, String> {
    match value.to_ascii_lowercase().as_str() {
        "bass" => Ok(SoundType::Bass),
        "pad" => Ok(SoundType::Pad),
        "lead" => Ok(SoundType::Lead),
        other => Err(format!("unknown sound '{other}' (expected bass, pad or lead)")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries chunk frames in the worker, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::CaptureWorker { config } = &cli.command {
        let audio: AudioConfig = ron::from_str(config).map_err(|e| Error::Config(e.to_string()))?;
        return audio::run_worker(&audio);
    }

    let config = JunoConfig::load_or_default(&cli.config)?;
    match cli.command {
        Commands::Ports => {
            for (i, name) in juno::midi::list_ports()?.iter().enumerate() {
                println!("{i}: {name}");
            }
            Ok(())
        }
        Commands::Devices => {
            for device in audio::list_input_devices()? {
                println!(
                    "{}: {} ({} ch){}",
                    device.index,
                    device.name,
                    device.input_channels,
                    if device.is_default { " [default]" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Play {
            sample,
            stream,
            only,
        } => {
            let mut sample = Sample::load(&sample)?;
            if !only.is_empty() {
                sample = sample.with_layers(&only);
            }
            play(config, &sample, stream)
        }
        Commands::Serve => serve(config),
        Commands::Export {
            sample,
            midi,
            wav,
            tail,
        } => {
            let sample = Sample::load(&sample)?;
            export::save_smf(&sample, &midi)?;
            match wav {
                Some(path) => record(config, &sample, tail, &path),
                None => Ok(()),
            }
        }
        Commands::CaptureWorker { .. } => Ok(()),
    }
}

fn play(config: JunoConfig, sample: &Sample, stream: bool) -> Result<()> {
    let studio = Studio::new(config)?;
    info!("Connected to {}", studio.connect()?);

    if !stream {
        let outcome = studio.engine().play_sync(sample)?;
        info!("Playback {:?}", outcome);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let server = runtime.block_on(StreamServer::bind(
        studio.capture().registry(),
        studio.config().audio.clone(),
        studio.config().stream.clone(),
    ))?;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = runtime.spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    let (done_tx, done_rx) = channel::bounded(1);
    studio.play(
        sample,
        true,
        Some(Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        })),
    )?;

    let budget = Duration::from_secs_f64(sample.duration_seconds()) + Duration::from_secs(5);
    match done_rx.recv_timeout(budget) {
        Ok(outcome) => info!("Playback {:?}", outcome),
        Err(_) => {
            warn!("Playback did not finish in time");
            studio.stop();
        }
    }

    let _ = stop_tx.send(());
    match runtime.block_on(server_task) {
        Ok(result) => result,
        Err(e) => Err(Error::Io(std::io::Error::other(e))),
    }
}

fn serve(config: JunoConfig) -> Result<()> {
    let capture = CaptureManager::new(config.audio.clone())?;
    capture.try_start()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let server =
            StreamServer::bind(capture.registry(), config.audio.clone(), config.stream.clone())
                .await?;
        server
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    });
    capture.stop();
    result
}

fn record(config: JunoConfig, sample: &Sample, tail: f64, path: &Path) -> Result<()> {
    let studio = Studio::new(config)?;
    info!("Connected to {}", studio.connect()?);
    let wav = studio.export_audio(sample, tail)?;
    std::fs::write(path, &wav)?;
    info!("Wrote {} ({} bytes)", path.display(), wav.len());
    Ok(())
}
