//! dubline - automated dubbing workflow
//!
//! Entry point of the `dubline` binary: loads the configuration, sets up
//! logging, runs the requested job and renders its progress events.

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use dubline::cli::{Args, Commands, ConfigAction};
use dubline::config::Config;
use dubline::events::{EventSink, PipelineEvent};
use dubline::job::JobState;
use dubline::narration::VoiceCatalog;
use dubline::storage::{ArtifactHandle, ArtifactKind};
use dubline::workflow::Workflow;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // `config init` must work without a valid configuration
    if let Commands::Config {
        action: ConfigAction::Init { path, force },
    } = &args.command
    {
        return init_config(path, *force);
    }

    let config = load_config(args.config.as_deref())?;
    setup_logging(args.verbose, &config.pipeline.work_dir)?;
    info!("Starting dubline");

    if let Commands::Voices = args.command {
        list_voices(&config);
        return Ok(());
    }

    let default_voice = config.narration.default_voice.clone();
    let workflow = Workflow::new(config).await?;

    let job_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());
    let (events, receiver) = EventSink::channel(job_id);
    let renderer = spawn_renderer(receiver, args.events_json);

    let result = run_command(&workflow, args.command, job_id, &default_voice, &cancel, &events).await;

    // Closing the channel lets the renderer finish
    drop(events);
    if let Err(e) = renderer.await {
        warn!("Progress display stopped abnormally: {}", e);
    }

    result?;
    info!("dubline finished successfully");
    Ok(())
}

async fn run_command(
    workflow: &Workflow,
    command: Commands,
    job_id: Uuid,
    default_voice: &str,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<()> {
    let store = workflow.store();

    match command {
        Commands::Dub { input, voice, output_dir } => {
            info!("Dubbing {}", input.display());
            let voice = voice.as_deref().unwrap_or(default_voice);
            let source = workflow.import_source(job_id, &input).await?;
            let outcome = workflow.dub_job(job_id, &source, voice, cancel, events).await;

            let output_dir = match output_dir {
                Some(dir) => dir,
                None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
            };
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "output".to_string());

            let artifacts = [
                (&outcome.artifacts.subtitle, format!("{}.srt", stem)),
                (&outcome.artifacts.narration, format!("{}.narration", stem)),
                (&outcome.artifacts.video, format!("{}.dubbed", stem)),
            ];
            for (handle, name) in artifacts {
                if let Some(handle) = handle {
                    let destination = with_artifact_extension(output_dir.join(name), handle);
                    export(workflow, handle, &destination).await?;
                }
            }

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            match outcome.state {
                JobState::Completed => Ok(()),
                state => Err(anyhow!(
                    "Job {} ended as {:?}: {}",
                    job_id,
                    state,
                    outcome.error.unwrap_or_default()
                )),
            }
        }
        Commands::Transcribe { input, output } => {
            info!("Transcribing {}", input.display());
            let source = workflow.import_source(job_id, &input).await?;
            let transcription = workflow.transcribe_job(job_id, &source, cancel, events).await?;
            export(workflow, &transcription.subtitle, &output).await?;
            if transcription.degradation.is_degraded() {
                warn!(
                    "{} chunks could not be transcribed and are left empty",
                    transcription.degradation.chunks.len()
                );
            }
            Ok(())
        }
        Commands::Narrate {
            subtitles,
            output,
            voice,
            duration,
        } => {
            info!("Narrating {}", subtitles.display());
            let voice = voice.as_deref().unwrap_or(default_voice);
            let subtitle = store.put_file(job_id, ArtifactKind::Subtitle, &subtitles).await?;
            let source_duration = duration.filter(|d| *d > 0.0).map(Duration::from_secs_f64);
            let narration = workflow
                .narrate_job(job_id, &subtitle, voice, source_duration, cancel, events)
                .await?;
            export(workflow, &narration.narration, &output).await?;
            for conflict in &narration.conflicts {
                warn!(
                    "Caption {} was cut {:.3}s short before caption {}",
                    conflict.caption_index,
                    conflict.overrun.as_secs_f64(),
                    conflict.next_caption_index
                );
            }
            Ok(())
        }
        Commands::Merge { video, narration, output } => {
            info!("Merging {} into {}", narration.display(), video.display());
            let video = workflow.import_source(job_id, &video).await?;
            let narration = store.put_file(job_id, ArtifactKind::Narration, &narration).await?;
            let dubbed = workflow.merge_job(job_id, &video, &narration, cancel, events).await?;
            export(workflow, &dubbed, &output).await
        }
        Commands::Extract { input, output } => {
            info!("Extracting audio from {}", input.display());
            let source = workflow.import_source(job_id, &input).await?;
            let audio = workflow.extract_audio_job(job_id, &source, cancel, events).await?;
            export(workflow, &audio, &output).await
        }
        Commands::Tts { text, voice, output } => {
            let voice = voice.as_deref().unwrap_or(default_voice);
            let speech = workflow.speak_text(job_id, &text, voice, cancel, events).await?;
            export(workflow, &speech, &output).await
        }
        Commands::Voices | Commands::Config { .. } => Ok(()),
    }
}

async fn export(workflow: &Workflow, handle: &ArtifactHandle, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    workflow.store().export(handle, destination).await?;
    info!("Wrote {} to {}", handle.kind().as_str(), destination.display());
    Ok(())
}

fn with_artifact_extension(path: PathBuf, handle: &ArtifactHandle) -> PathBuf {
    match handle.extension() {
        Some(extension) => {
            let mut name = path.into_os_string();
            name.push(".");
            name.push(extension);
            PathBuf::from(name)
        }
        None => path,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            // Try dubline.toml in the current directory first
            if Path::new("dubline.toml").exists() {
                Config::from_file("dubline.toml")?
            } else {
                Config::default()
            }
        }
    };
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!("{} already exists, use --force to overwrite", path.display()));
    }
    Config::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn list_voices(config: &Config) {
    let catalog = VoiceCatalog::from_config(&config.voices);
    println!("\nAvailable voices:");
    println!("{:<15} {:<8} {:<50}", "Id", "Engine", "Voice");
    println!("{}", "-".repeat(73));
    for voice in catalog.list() {
        let engine = format!("{:?}", voice.engine).to_lowercase();
        println!("{:<15} {:<8} {:<50}", voice.id, engine, voice.target);
    }
}

fn watch_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the job");
            cancel.cancel();
        }
    });
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Render progress events as bars, or as JSON lines when `json` is set
fn spawn_renderer(mut receiver: UnboundedReceiver<PipelineEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bars = MultiProgress::new();
        let mut chunks: Option<ProgressBar> = None;
        let mut captions: Option<ProgressBar> = None;

        while let Some(event) = receiver.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Cannot serialize event: {}", e),
                }
                continue;
            }

            match event {
                PipelineEvent::ChunkCompleted { chunk_count, .. } => {
                    let bar = chunks.get_or_insert_with(|| {
                        let bar = bars.add(ProgressBar::new(chunk_count as u64));
                        bar.set_style(bar_style());
                        bar.set_message("transcribing");
                        bar
                    });
                    bar.inc(1);
                    if bar.position() >= chunk_count as u64 {
                        bar.finish_with_message("transcribed");
                    }
                }
                PipelineEvent::CaptionSynthesized { caption_count, .. } => {
                    let bar = captions.get_or_insert_with(|| {
                        let bar = bars.add(ProgressBar::new(caption_count as u64));
                        bar.set_style(bar_style());
                        bar.set_message("narrating");
                        bar
                    });
                    bar.inc(1);
                    if bar.position() >= caption_count as u64 {
                        bar.finish_with_message("narrated");
                    }
                }
                PipelineEvent::StageFailed { kind, detail, .. } => {
                    let line = format!("{:?}: {}", kind, detail);
                    if bars.println(&line).is_err() {
                        eprintln!("{}", line);
                    }
                }
            }
        }

        for bar in chunks.iter().chain(captions.iter()) {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    })
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool, work_dir: &Path) -> Result<()> {
    let log_dir = work_dir.join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "dubline.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("dubline.log").display()
    );

    Ok(())
}
