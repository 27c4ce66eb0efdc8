use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DubError, Result};

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Copy video stream
    pub fn copy_video(self) -> Self {
        self.video_codec("copy")
    }

    /// Disable video
    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    /// Pick a stream for the output, e.g. "0:v:0"
    pub fn map<S: Into<String>>(self, specifier: S) -> Self {
        self.arg("-map").arg(specifier)
    }

    /// Set audio sample rate
    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    /// Set audio channels
    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    /// Set audio bitrate
    pub fn audio_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:a").arg(bitrate)
    }

    /// Add audio filter
    pub fn audio_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-af").arg(filter)
    }

    /// Stop writing when the shortest input ends
    pub fn shortest(self) -> Self {
        self.arg("-shortest")
    }

    /// Execute the command, discarding its output
    pub async fn execute(&self) -> Result<()> {
        self.execute_capture().await.map(|_| ())
    }

    /// Execute the command and return its stdout
    pub async fn execute_capture(&self) -> Result<String> {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DubError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DubError::Media(format!(
                "{} failed: {}",
                self.description,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Builder for the ffmpeg/ffprobe invocations the pipeline needs
pub struct MediaCommandBuilder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl MediaCommandBuilder {
    /// Create a new command builder
    pub fn new<S1: Into<String>, S2: Into<String>>(ffmpeg_path: S1, ffprobe_path: S2) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Build stream/duration probe command (JSON on stdout)
    pub fn probe<P: AsRef<Path>>(&self, input_path: P) -> MediaCommand {
        MediaCommand::new(&self.ffprobe_path, "Media probe")
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration,format_name:stream=codec_type,sample_rate"])
            .args(["-of", "json"])
            .output(input_path)
    }

    /// Build audio extraction command: mono 16-bit PCM WAV at `sample_rate`
    pub fn extract_audio<P: AsRef<Path>>(
        &self,
        input_path: P,
        audio_path: P,
        sample_rate: u32,
    ) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Audio extraction")
            .overwrite()
            .input(input_path)
            .no_video()
            .audio_codec("pcm_s16le")
            .audio_sample_rate(sample_rate)
            .audio_channels(1)
            .output(audio_path)
    }

    /// Build pitch-preserving speed change command
    pub fn change_tempo<P: AsRef<Path>>(&self, input_path: P, output_path: P, ratio: f64) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Tempo change")
            .overwrite()
            .input(input_path)
            .audio_filter(atempo_chain(ratio))
            .audio_codec("pcm_s16le")
            .audio_channels(1)
            .output(output_path)
    }

    /// Build MP3 encoding command
    pub fn encode_mp3<P: AsRef<Path>>(&self, input_path: P, output_path: P, bitrate: &str) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Narration encoding")
            .overwrite()
            .input(input_path)
            .audio_codec("libmp3lame")
            .audio_bitrate(bitrate)
            .output(output_path)
    }

    /// Build narration merge command: video stream copied, original audio dropped
    pub fn merge_narration<P: AsRef<Path>>(
        &self,
        video_path: P,
        narration_path: P,
        output_path: P,
        audio_codec: &str,
        additional_options: &[String],
    ) -> MediaCommand {
        let mut cmd = MediaCommand::new(&self.ffmpeg_path, "Narration merge")
            .overwrite()
            .input(video_path)
            .input(narration_path)
            .map("0:v:0")
            .map("1:a:0")
            .copy_video()
            .audio_codec(audio_codec)
            .shortest();

        // Add user-specified additional options
        for option in additional_options {
            cmd = cmd.arg(option);
        }

        cmd.output(output_path)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Version check").arg("-version")
    }
}

/// atempo only accepts factors in [0.5, 2.0] on older ffmpeg builds, so larger
/// ratios are expressed as a chain.
pub fn atempo_chain(ratio: f64) -> String {
    let mut remaining = ratio.max(0.5);
    let mut stages = Vec::new();
    while remaining > 2.0 {
        stages.push("atempo=2.0".to_string());
        remaining /= 2.0;
    }
    stages.push(format!("atempo={:.6}", remaining));
    stages.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atempo_chain() {
        assert_eq!(atempo_chain(1.5), "atempo=1.500000");
        assert_eq!(atempo_chain(3.0), "atempo=2.0,atempo=1.500000");
    }

    #[test]
    fn test_merge_command_copies_video() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.merge_narration("in.mp4", "voice.mp3", "out.mp4", "aac", &[]);
        let args = cmd.args.join(" ");
        assert_eq!(
            args,
            "-y -i in.mp4 -i voice.mp3 -map 0:v:0 -map 1:a:0 -c:v copy -c:a aac -shortest out.mp4"
        );
    }

    #[test]
    fn test_extract_command() {
        let builder = MediaCommandBuilder::new("ffmpeg", "ffprobe");
        let cmd = builder.extract_audio("movie.mkv", "audio.wav", 16000);
        assert_eq!(cmd.binary_path, "ffmpeg");
        assert_eq!(
            cmd.args.join(" "),
            "-y -i movie.mkv -vn -c:a pcm_s16le -ar 16000 -ac 1 audio.wav"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_media_error() {
        let cmd = MediaCommand::new("dubline-no-such-binary", "Nothing").arg("-version");
        assert!(matches!(cmd.execute().await, Err(DubError::Media(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abandoned_command_is_killed() {
        use crate::narration::piper::tests::process_running;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ffmpeg.pid");
        let cmd = MediaCommand::new("sh", "Slow tempo change")
            .arg("-c")
            .arg(format!("echo $$ > {}; exec sleep 30", pid_file.display()));

        assert!(tokio::time::timeout(Duration::from_millis(500), cmd.execute()).await.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let mut running = true;
        for _ in 0..40 {
            running = process_running(&pid);
            if !running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!running, "command {} outlived its caller", pid.trim());
    }
}
