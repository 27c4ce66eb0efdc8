use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::{read_wav_file, write_wav_file};
use crate::chunker::{ChunkPlan, ChunkerSettings};
use crate::config::{Config, NarrationFormat};
use crate::error::{DubError, Result};
use crate::events::{EventSink, FailureKind};
use crate::job::{DegradationReport, DegradedCaption, JobArtifacts, JobOutcome, JobState};
use crate::media::{MediaInfo, MediaProcessorFactory, MediaProcessorTrait};
use crate::narration::{
    ClipProcessor, FfmpegClipProcessor, FittingSettings, NarrationSegment, NarrationSynthesizer, VoiceBackend,
    VoiceBackendFactory, VoiceCatalog,
};
use crate::retry::RetryPolicy;
use crate::storage::{ArtifactHandle, ArtifactKind, ArtifactStore, JobWorkspace, LocalArtifactStore};
use crate::subtitle::{parse_srt, serialize_srt, Caption};
use crate::timeline::{assemble, TimelineSettings, TimingConflict};
use crate::transcribe::{combine_transcripts, transcribe_chunks, ChunkStageSettings, Transcriber, TranscriberFactory};

/// Result of the transcription stage
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    pub subtitle: ArtifactHandle,
    pub captions: Vec<Caption>,
    pub media: MediaInfo,
    pub degradation: DegradationReport,
}

/// Result of the narration stage
#[derive(Debug, Clone)]
pub struct NarrationOutcome {
    pub narration: ArtifactHandle,
    pub segments: Vec<NarrationSegment>,
    pub duration: Duration,
    pub conflicts: Vec<TimingConflict>,
    pub degradation: DegradationReport,
}

pub struct Workflow {
    config: Config,
    media: Arc<dyn MediaProcessorTrait>,
    transcriber: Arc<dyn Transcriber>,
    store: Arc<dyn ArtifactStore>,
    catalog: VoiceCatalog,
    voice_backend: Option<Arc<dyn VoiceBackend>>,
    clip_processor: Option<Arc<dyn ClipProcessor>>,
}

impl Workflow {
    /// Build the default pipeline: ffmpeg, remote transcription, local artifact store
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let media: Arc<dyn MediaProcessorTrait> = Arc::from(MediaProcessorFactory::create_processor(config.media.clone()));

        // Check dependencies
        media.check_availability().await?;

        let transcriber = TranscriberFactory::create_transcriber(&config.transcriber)?;
        let store = Arc::new(LocalArtifactStore::new(config.pipeline.storage_dir.clone()));
        Ok(Self::with_components(config, media, transcriber, store))
    }

    pub fn with_components(
        config: Config,
        media: Arc<dyn MediaProcessorTrait>,
        transcriber: Arc<dyn Transcriber>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let catalog = VoiceCatalog::from_config(&config.voices);
        Self {
            config,
            media,
            transcriber,
            store,
            catalog,
            voice_backend: None,
            clip_processor: None,
        }
    }

    /// Serve every voice with `backend` instead of the configured engines
    pub fn with_voice_backend(mut self, backend: Arc<dyn VoiceBackend>) -> Self {
        self.voice_backend = Some(backend);
        self
    }

    pub fn with_clip_processor(mut self, processor: Arc<dyn ClipProcessor>) -> Self {
        self.clip_processor = Some(processor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn voices(&self) -> &VoiceCatalog {
        &self.catalog
    }

    /// Copy a local file into the store as the source of `job_id`
    pub async fn import_source(&self, job_id: Uuid, path: &Path) -> Result<ArtifactHandle> {
        self.store.put_file(job_id, ArtifactKind::Source, path).await
    }

    /// Extract the source's audio track as WAV at the transcription sample rate
    pub async fn extract_audio_job(
        &self,
        job_id: Uuid,
        source: &ArtifactHandle,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ArtifactHandle> {
        let result = async {
            checkpoint(cancel)?;
            let workspace = self.workspace(job_id)?;
            let source_path = self.store.local_path(source).await?;
            let info = self.media.probe(&source_path).await?;
            if !info.has_audio {
                return Err(DubError::InvalidMedia(format!("{} has no audio stream", source_path.display())));
            }
            let audio_path = workspace.file("audio.wav");
            self.media
                .extract_audio(&source_path, &audio_path, self.config.media.extract_sample_rate)
                .await?;
            self.store.put_file(job_id, ArtifactKind::Audio, &audio_path).await
        }
        .await;
        report_failure(events, result)
    }

    /// Probe, chunk, transcribe and combine; stores the SRT as the job's subtitle
    pub async fn transcribe_job(
        &self,
        job_id: Uuid,
        source: &ArtifactHandle,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<TranscriptionOutcome> {
        report_failure(events, self.run_transcription(job_id, source, cancel, events).await)
    }

    /// Synthesize narration for a stored subtitle and lay it on one track.
    ///
    /// The track lasts at least `source_duration` when given.
    pub async fn narrate_job(
        &self,
        job_id: Uuid,
        subtitle: &ArtifactHandle,
        voice_id: &str,
        source_duration: Option<Duration>,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<NarrationOutcome> {
        let result = self
            .run_narration(job_id, subtitle, voice_id, source_duration, cancel, events)
            .await;
        report_failure(events, result)
    }

    /// Replace the audio of `video` with `narration`, stream-copying the video
    pub async fn merge_job(
        &self,
        job_id: Uuid,
        video: &ArtifactHandle,
        narration: &ArtifactHandle,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ArtifactHandle> {
        report_failure(events, self.run_merge(job_id, video, narration, cancel).await)
    }

    /// Synthesize free text with one voice, no timeline fitting
    pub async fn speak_text(
        &self,
        job_id: Uuid,
        text: &str,
        voice_id: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<ArtifactHandle> {
        let result = async {
            let length = text.trim().chars().count();
            if length == 0 || length > self.config.narration.max_text_chars {
                return Err(DubError::synthesis(
                    format!(
                        "Text must have between 1 and {} characters, got {}",
                        self.config.narration.max_text_chars, length
                    ),
                    false,
                ));
            }
            checkpoint(cancel)?;
            let workspace = self.workspace(job_id)?;
            let synthesizer = self.synthesizer(voice_id, &workspace)?;
            let audio = synthesizer.speak(text.trim()).await?;
            checkpoint(cancel)?;
            self.store_narration(job_id, &workspace, &audio).await
        }
        .await;
        report_failure(events, result)
    }

    /// Full pipeline: transcription, narration and, for video sources, merge.
    ///
    /// Never returns an error; failures and cancellation are reported in the
    /// outcome's state and as a `stageFailed` event.
    pub async fn dub_job(
        &self,
        job_id: Uuid,
        source: &ArtifactHandle,
        voice_id: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> JobOutcome {
        let started_at = Utc::now();
        info!("Job {} started with voice {}", job_id, voice_id);

        let mut artifacts = JobArtifacts::default();
        let mut degradation = DegradationReport::default();
        let mut timing_conflicts = Vec::new();

        let result = async {
            let transcription = self.run_transcription(job_id, source, cancel, events).await?;
            artifacts.subtitle = Some(transcription.subtitle.clone());
            degradation.extend(transcription.degradation);

            let narration = self
                .run_narration(
                    job_id,
                    &transcription.subtitle,
                    voice_id,
                    Some(transcription.media.duration),
                    cancel,
                    events,
                )
                .await?;
            artifacts.narration = Some(narration.narration.clone());
            degradation.extend(narration.degradation);
            timing_conflicts = narration.conflicts;

            if transcription.media.has_video {
                let video = self.run_merge(job_id, source, &narration.narration, cancel).await?;
                artifacts.video = Some(video);
            } else {
                info!("Source has no video stream, skipping merge");
            }
            Ok::<(), DubError>(())
        }
        .await;

        let (state, error) = match result {
            Ok(()) => (JobState::Completed, None),
            Err(e) => {
                let state = if matches!(e, DubError::Cancelled) {
                    JobState::Cancelled
                } else {
                    JobState::Failed
                };
                emit_failure(events, &e);
                (state, Some(e.to_string()))
            }
        };

        if degradation.is_degraded() {
            warn!(
                "Job {} finished degraded: {} chunks, {} captions",
                job_id,
                degradation.chunks.len(),
                degradation.captions.len()
            );
        }
        info!("Job {} finished as {:?}", job_id, state);

        JobOutcome {
            job_id,
            state,
            started_at,
            finished_at: Utc::now(),
            artifacts,
            degradation,
            timing_conflicts,
            error,
        }
    }

    async fn run_transcription(
        &self,
        job_id: Uuid,
        source: &ArtifactHandle,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<TranscriptionOutcome> {
        checkpoint(cancel)?;
        let workspace = self.workspace(job_id)?;
        let source_path = self.store.local_path(source).await?;

        let media = self.media.probe(&source_path).await?;
        if !media.has_audio {
            return Err(DubError::InvalidMedia(format!("{} has no audio stream", source_path.display())));
        }

        let audio_path = workspace.file("audio.wav");
        self.media
            .extract_audio(&source_path, &audio_path, self.config.media.extract_sample_rate)
            .await?;
        let audio = read_wav_file(&audio_path)
            .await
            .map_err(|e| DubError::InvalidMedia(format!("Extracted audio is unreadable: {}", e)))?;
        checkpoint(cancel)?;

        let settings = ChunkerSettings::from_config(&self.config.chunker, audio.sample_rate());
        let plan = ChunkPlan::analyze(&audio, &settings)?;

        let stage = ChunkStageSettings {
            workers: self.config.pipeline.workers,
            chunk_deadline: Duration::from_secs(self.config.transcriber.chunk_deadline_secs),
            retry: RetryPolicy::from_config(&self.config.retry),
        };
        let results = transcribe_chunks(self.transcriber.clone(), &plan, &audio, &stage, cancel, events).await?;
        if results.iter().all(|r| r.is_degraded()) {
            return Err(DubError::transcription(
                format!("All {} chunks failed to transcribe", results.len()),
                false,
            ));
        }

        let epsilon = Duration::from_secs_f64(self.config.transcriber.boundary_epsilon_secs.max(0.0));
        let combined = combine_transcripts(&results, epsilon);
        if combined.has_no_speech() {
            warn!("No speech recognized in {}", source_path.display());
        }
        checkpoint(cancel)?;

        let srt = serialize_srt(&combined.captions);
        let subtitle = self
            .store
            .put_bytes(job_id, ArtifactKind::Subtitle, "srt", srt.as_bytes())
            .await?;
        info!("Transcription stored as {} ({} captions)", subtitle.key(), combined.captions.len());

        Ok(TranscriptionOutcome {
            subtitle,
            captions: combined.captions,
            media,
            degradation: DegradationReport {
                chunks: combined.degraded_chunks,
                captions: Vec::new(),
            },
        })
    }

    async fn run_narration(
        &self,
        job_id: Uuid,
        subtitle: &ArtifactHandle,
        voice_id: &str,
        source_duration: Option<Duration>,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<NarrationOutcome> {
        checkpoint(cancel)?;
        let bytes = self.store.read_bytes(subtitle).await?;
        let content = String::from_utf8(bytes)
            .map_err(|e| DubError::malformed(0, format!("subtitle is not UTF-8: {}", e)))?;
        let captions = parse_srt(&content)?;
        info!("Narrating {} captions", captions.len());

        let workspace = self.workspace(job_id)?;
        let synthesizer = self.synthesizer(voice_id, &workspace)?;
        let segments = synthesizer
            .synthesize_all(&captions, self.config.pipeline.workers, cancel, events)
            .await?;
        checkpoint(cancel)?;

        let timeline = TimelineSettings {
            sample_rate: self.config.narration.sample_rate,
            guard_gap: self.config.narration.guard_gap(),
        };
        let track = assemble(&segments, source_duration.unwrap_or_default(), &timeline)?;
        let narration = self.store_narration(job_id, &workspace, &track.audio).await?;

        let degraded_captions = segments
            .iter()
            .filter(|s| s.outcome.is_degraded())
            .map(|s| DegradedCaption {
                index: s.caption_index,
                outcome: s.outcome,
                reason: s.failure.clone(),
            })
            .collect();

        Ok(NarrationOutcome {
            narration,
            duration: track.audio.duration(),
            segments,
            conflicts: track.conflicts,
            degradation: DegradationReport {
                chunks: Vec::new(),
                captions: degraded_captions,
            },
        })
    }

    async fn run_merge(
        &self,
        job_id: Uuid,
        video: &ArtifactHandle,
        narration: &ArtifactHandle,
        cancel: &CancellationToken,
    ) -> Result<ArtifactHandle> {
        checkpoint(cancel)?;
        let workspace = self.workspace(job_id)?;
        let video_path = self
            .store
            .local_path(video)
            .await
            .map_err(|e| DubError::Merge(format!("Source video unavailable: {}", e)))?;
        let narration_path = self
            .store
            .local_path(narration)
            .await
            .map_err(|e| DubError::Merge(format!("Narration unavailable: {}", e)))?;

        let output = workspace.file("dubbed.mp4");
        self.media.merge_narration(&video_path, &narration_path, &output).await?;
        self.store.put_file(job_id, ArtifactKind::Video, &output).await
    }

    async fn store_narration(
        &self,
        job_id: Uuid,
        workspace: &JobWorkspace,
        audio: &crate::audio::AudioBuffer,
    ) -> Result<ArtifactHandle> {
        let wav_path = workspace.file("narration.wav");
        write_wav_file(&wav_path, audio).await?;

        let output = match self.config.narration.output_format {
            NarrationFormat::Wav => wav_path,
            NarrationFormat::Mp3 => {
                let mp3_path = workspace.file(&format!("narration.{}", NarrationFormat::Mp3.extension()));
                self.media.encode_mp3(&wav_path, &mp3_path).await?;
                mp3_path
            }
        };
        self.store.put_file(job_id, ArtifactKind::Narration, &output).await
    }

    fn synthesizer(&self, voice_id: &str, workspace: &JobWorkspace) -> Result<NarrationSynthesizer> {
        let entry = self.catalog.resolve(voice_id)?;
        let backend = match &self.voice_backend {
            Some(backend) => backend.clone(),
            None => VoiceBackendFactory::create_backend(entry.engine, &self.config.voices)?,
        };
        let clips: Arc<dyn ClipProcessor> = match &self.clip_processor {
            Some(processor) => processor.clone(),
            None => Arc::new(FfmpegClipProcessor::new(self.media.clone(), workspace.file("clips"))),
        };

        Ok(NarrationSynthesizer::new(
            backend,
            clips,
            RetryPolicy::from_config(&self.config.retry),
            voice_id,
            FittingSettings::from_config(&self.config.narration),
        ))
    }

    fn workspace(&self, job_id: Uuid) -> Result<JobWorkspace> {
        JobWorkspace::new(&self.config.pipeline.work_dir, job_id)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(DubError::Cancelled)
    } else {
        Ok(())
    }
}

/// Stage a fatal error is attributed to
fn failure_kind(error: &DubError) -> FailureKind {
    match error {
        DubError::InvalidMedia(_) | DubError::Media(_) => FailureKind::Probe,
        DubError::Transcription { .. } => FailureKind::Transcription,
        DubError::MalformedSubtitle { .. } => FailureKind::Subtitle,
        DubError::Synthesis { .. } | DubError::UnsupportedVoice(_) => FailureKind::Synthesis,
        DubError::Audio(_) => FailureKind::Assembly,
        DubError::Merge(_) => FailureKind::Merge,
        DubError::Cancelled => FailureKind::Cancelled,
        _ => FailureKind::Storage,
    }
}

fn emit_failure(events: &EventSink, error: &DubError) {
    if matches!(error, DubError::Cancelled) {
        info!("Job {} cancelled", events.job_id());
    } else {
        error!("Job {} failed: {}", events.job_id(), error);
    }
    events.stage_failed(failure_kind(error), error.to_string());
}

fn report_failure<T>(events: &EventSink, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        emit_failure(events, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{encode_wav, frames_for, tests::tone_with_gaps, AudioBuffer};
    use crate::events::PipelineEvent;
    use crate::narration::tempo::tests::NaiveClipProcessor;
    use crate::narration::{SynthesisOptions, VoiceEngine};
    use crate::transcribe::tests::FakeTranscriber;
    use async_trait::async_trait;

    /// Media processor over WAV "media". Merging copies the narration.
    struct WavMedia {
        has_video: bool,
    }

    #[async_trait]
    impl MediaProcessorTrait for WavMedia {
        async fn probe(&self, input_path: &Path) -> Result<MediaInfo> {
            let audio = read_wav_file(input_path)
                .await
                .map_err(|e| DubError::InvalidMedia(e.to_string()))?;
            if audio.is_empty() {
                return Err(DubError::InvalidMedia("Media duration is 0s".to_string()));
            }
            Ok(MediaInfo {
                duration: audio.duration(),
                has_video: self.has_video,
                has_audio: true,
                sample_rate: Some(audio.sample_rate()),
                format_name: Some("wav".to_string()),
            })
        }

        async fn extract_audio(&self, input_path: &Path, audio_path: &Path, sample_rate: u32) -> Result<()> {
            let audio = read_wav_file(input_path).await?.resample_to(sample_rate)?;
            write_wav_file(audio_path, &audio).await
        }

        async fn change_tempo(&self, _input: &Path, _output: &Path, _ratio: f64) -> Result<()> {
            Err(DubError::Media("not used".to_string()))
        }

        async fn encode_mp3(&self, input_path: &Path, output_path: &Path) -> Result<()> {
            tokio::fs::copy(input_path, output_path).await?;
            Ok(())
        }

        async fn merge_narration(&self, _video_path: &Path, narration_path: &Path, output_path: &Path) -> Result<()> {
            if !self.has_video {
                return Err(DubError::Merge("no video stream".to_string()));
            }
            tokio::fs::copy(narration_path, output_path).await?;
            Ok(())
        }

        async fn check_availability(&self) -> Result<()> {
            Ok(())
        }

        async fn get_version_info(&self) -> Result<String> {
            Ok("wav".to_string())
        }
    }

    /// Speaks every text as a quarter second of tone
    struct ToneVoice;

    #[async_trait]
    impl VoiceBackend for ToneVoice {
        fn engine(&self) -> VoiceEngine {
            VoiceEngine::Cloud
        }

        async fn synthesize(&self, _text: &str, _voice_id: &str, _options: &SynthesisOptions) -> Result<Vec<u8>> {
            encode_wav(&AudioBuffer::new(vec![0.5; frames_for(Duration::from_millis(250), 8_000)], 8_000))
        }

        async fn check_availability(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        workflow: Workflow,
        scratch: std::path::PathBuf,
    }

    fn fixture(transcriber: FakeTranscriber, has_video: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.pipeline.work_dir = dir.path().join("work");
        config.pipeline.storage_dir = dir.path().join("files");
        config.pipeline.workers = 2;
        config.chunker.max_chunk_secs = 10.0;
        config.chunker.lookback_secs = 2.0;
        config.media.extract_sample_rate = 8_000;
        config.narration.sample_rate = 8_000;
        config.narration.output_format = NarrationFormat::Wav;
        config.retry.max_retries = 1;
        config.retry.initial_backoff_ms = 0;

        let store = Arc::new(LocalArtifactStore::new(config.pipeline.storage_dir.clone()));
        let workflow = Workflow::with_components(config, Arc::new(WavMedia { has_video }), Arc::new(transcriber), store)
            .with_voice_backend(Arc::new(ToneVoice))
            .with_clip_processor(Arc::new(NaiveClipProcessor));
        let scratch = dir.path().join("input");
        std::fs::create_dir_all(&scratch).unwrap();
        Fixture {
            _dir: dir,
            workflow,
            scratch,
        }
    }

    impl Fixture {
        async fn source(&self, job_id: Uuid, secs: u64, gaps: &[(f64, f64)]) -> ArtifactHandle {
            let path = self.scratch.join(format!("{}.wav", job_id));
            let audio = tone_with_gaps(Duration::from_secs(secs), gaps, 8_000);
            write_wav_file(&path, &audio).await.unwrap();
            self.workflow.import_source(job_id, &path).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_dub_job_produces_all_artifacts() {
        let fx = fixture(FakeTranscriber::new(&[]), true);
        let job_id = Uuid::new_v4();
        let source = fx.source(job_id, 25, &[]).await;
        let (events, mut receiver) = EventSink::channel(job_id);

        let outcome = fx
            .workflow
            .dub_job(job_id, &source, "edresson", &CancellationToken::new(), &events)
            .await;

        assert_eq!(outcome.state, JobState::Completed, "error: {:?}", outcome.error);
        assert!(!outcome.is_degraded());
        assert!(outcome.artifacts.video.is_some());

        let store = fx.workflow.store();
        let srt = store.read_bytes(outcome.artifacts.subtitle.as_ref().unwrap()).await.unwrap();
        let captions = parse_srt(&String::from_utf8(srt).unwrap()).unwrap();
        assert_eq!(captions.len(), 3);

        let narration_path = store.local_path(outcome.artifacts.narration.as_ref().unwrap()).await.unwrap();
        let narration = read_wav_file(&narration_path).await.unwrap();
        assert!(narration.duration() >= Duration::from_secs(25));

        let mut chunk_events = 0;
        let mut caption_events = 0;
        while let Ok(event) = receiver.try_recv() {
            match event {
                PipelineEvent::ChunkCompleted { .. } => chunk_events += 1,
                PipelineEvent::CaptionSynthesized { .. } => caption_events += 1,
                PipelineEvent::StageFailed { detail, .. } => panic!("unexpected failure: {}", detail),
            }
        }
        assert_eq!((chunk_events, caption_events), (3, 3));
    }

    #[tokio::test]
    async fn test_failing_chunk_degrades_the_job() {
        // Chunks of 9 s, 10 s and 8 s; the middle one times out twice
        let fx = fixture(FakeTranscriber::new(&[10_000]), false);
        let job_id = Uuid::new_v4();
        let source = fx.source(job_id, 27, &[(8.5, 9.5)]).await;

        let outcome = fx
            .workflow
            .dub_job(job_id, &source, "br-yara", &CancellationToken::new(), &EventSink::disabled(job_id))
            .await;

        assert_eq!(outcome.state, JobState::Completed, "error: {:?}", outcome.error);
        assert!(outcome.is_degraded());
        assert_eq!(outcome.degradation.chunks.len(), 1);
        assert_eq!(outcome.degradation.chunks[0].index, 1);
        // Audio-only source: nothing to merge into
        assert!(outcome.artifacts.video.is_none());

        let srt = fx
            .workflow
            .store()
            .read_bytes(outcome.artifacts.subtitle.as_ref().unwrap())
            .await
            .unwrap();
        let captions = parse_srt(&String::from_utf8(srt).unwrap()).unwrap();
        assert_eq!(captions.len(), 3);
        assert_eq!(captions[1].text, "");
        assert_eq!(captions[1].start, Duration::from_secs(9));
        assert_eq!(captions[1].end, Duration::from_secs(19));
        assert_eq!(captions[2].start, Duration::from_millis(19_500));
    }

    #[tokio::test]
    async fn test_every_chunk_failing_fails_the_job() {
        let fx = fixture(FakeTranscriber::new(&[5_000]), false);
        let job_id = Uuid::new_v4();
        let source = fx.source(job_id, 5, &[]).await;
        let (events, mut receiver) = EventSink::channel(job_id);

        let outcome = fx
            .workflow
            .dub_job(job_id, &source, "edresson", &CancellationToken::new(), &events)
            .await;
        assert_eq!(outcome.state, JobState::Failed);
        assert!(outcome.artifacts.subtitle.is_none());

        let mut transcription_failures = 0;
        while let Ok(event) = receiver.try_recv() {
            if let PipelineEvent::StageFailed { kind: FailureKind::Transcription, .. } = event {
                transcription_failures += 1;
            }
        }
        // One for the degraded chunk, one for the job
        assert_eq!(transcription_failures, 2);
    }

    #[tokio::test]
    async fn test_cancelled_job() {
        let fx = fixture(FakeTranscriber::new(&[]), true);
        let job_id = Uuid::new_v4();
        let source = fx.source(job_id, 5, &[]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fx
            .workflow
            .dub_job(job_id, &source, "edresson", &cancel, &EventSink::disabled(job_id))
            .await;
        assert_eq!(outcome.state, JobState::Cancelled);
        // Workspaces are gone after the job
        let work_dir = &fx.workflow.config().pipeline.work_dir;
        assert!(!work_dir.exists() || std::fs::read_dir(work_dir).unwrap().count() == 0);
    }

    #[tokio::test]
    async fn test_narrate_rejects_malformed_subtitle() {
        let fx = fixture(FakeTranscriber::new(&[]), false);
        let job_id = Uuid::new_v4();
        let subtitle = fx
            .workflow
            .store()
            .put_bytes(job_id, ArtifactKind::Subtitle, "srt", b"1\n00:00:02,000 --> 00:00:01,000\nbad\n\n")
            .await
            .unwrap();

        let result = fx
            .workflow
            .narrate_job(job_id, &subtitle, "edresson", None, &CancellationToken::new(), &EventSink::disabled(job_id))
            .await;
        assert!(matches!(result, Err(DubError::MalformedSubtitle { block: 1, .. })));
    }

    #[tokio::test]
    async fn test_narrate_unknown_voice() {
        let fx = fixture(FakeTranscriber::new(&[]), false);
        let job_id = Uuid::new_v4();
        let subtitle = fx
            .workflow
            .store()
            .put_bytes(job_id, ArtifactKind::Subtitle, "srt", "1\n00:00:00,000 --> 00:00:01,000\nolá\n\n".as_bytes())
            .await
            .unwrap();

        let result = fx
            .workflow
            .narrate_job(job_id, &subtitle, "nobody", None, &CancellationToken::new(), &EventSink::disabled(job_id))
            .await;
        assert!(matches!(result, Err(DubError::UnsupportedVoice(_))));
    }

    #[tokio::test]
    async fn test_merge_without_video_stream() {
        let fx = fixture(FakeTranscriber::new(&[]), false);
        let job_id = Uuid::new_v4();
        let audio_only = fx.source(job_id, 2, &[]).await;

        let result = fx
            .workflow
            .merge_job(job_id, &audio_only, &audio_only, &CancellationToken::new(), &EventSink::disabled(job_id))
            .await;
        assert!(matches!(result, Err(DubError::Merge(_))));
    }

    #[tokio::test]
    async fn test_speak_text_limits() {
        let fx = fixture(FakeTranscriber::new(&[]), false);
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let events = EventSink::disabled(job_id);

        let handle = fx.workflow.speak_text(job_id, "Olá, mundo", "jeff", &cancel, &events).await.unwrap();
        assert_eq!(handle.kind(), ArtifactKind::Narration);
        let path = fx.workflow.store().local_path(&handle).await.unwrap();
        assert_eq!(read_wav_file(&path).await.unwrap().duration(), Duration::from_millis(250));

        let too_long = "a".repeat(3001);
        assert!(fx.workflow.speak_text(job_id, &too_long, "jeff", &cancel, &events).await.is_err());
        assert!(fx.workflow.speak_text(job_id, "   ", "jeff", &cancel, &events).await.is_err());
    }
}
