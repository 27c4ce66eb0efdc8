use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print progress events as JSON lines instead of progress bars
    #[arg(long, global = true)]
    pub events_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe, narrate and re-mux a video or audio file
    Dub {
        /// Input video or audio file
        #[arg(short, long)]
        input: PathBuf,

        /// Voice id (see `dubline voices`)
        #[arg(long)]
        voice: Option<String>,

        /// Output directory for the subtitle, narration and dubbed video
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Transcribe a media file into an SRT subtitle
    Transcribe {
        /// Input video or audio file
        #[arg(short, long)]
        input: PathBuf,

        /// Output SRT file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Synthesize a narration track timed to an SRT subtitle
    Narrate {
        /// Input SRT file
        #[arg(short, long)]
        subtitles: PathBuf,

        /// Output narration file
        #[arg(short, long)]
        output: PathBuf,

        /// Voice id (see `dubline voices`)
        #[arg(long)]
        voice: Option<String>,

        /// Minimum track length in seconds, usually the source duration
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Replace the audio of a video with a narration track
    Merge {
        /// Input video file
        #[arg(long)]
        video: PathBuf,

        /// Narration audio file
        #[arg(short, long)]
        narration: PathBuf,

        /// Output video file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Extract the audio track of a media file as WAV
    Extract {
        /// Input video or audio file
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Speak a text with one voice
    Tts {
        /// Text to speak
        #[arg(short, long)]
        text: String,

        /// Voice id (see `dubline voices`)
        #[arg(long)]
        voice: Option<String>,

        /// Output audio file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List available voices
    Voices,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Destination file
        #[arg(short, long, default_value = "dubline.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dub() {
        let args = Args::parse_from(["dubline", "--events-json", "dub", "-i", "talk.mp4", "--voice", "br-yara"]);
        assert!(args.events_json);
        match args.command {
            Commands::Dub { input, voice, output_dir } => {
                assert_eq!(input, PathBuf::from("talk.mp4"));
                assert_eq!(voice.as_deref(), Some("br-yara"));
                assert!(output_dir.is_none());
            }
            _ => panic!("expected dub"),
        }
    }

    #[test]
    fn test_parse_config_init_default_path() {
        let args = Args::parse_from(["dubline", "config", "init"]);
        match args.command {
            Commands::Config {
                action: ConfigAction::Init { path, force },
            } => {
                assert_eq!(path, PathBuf::from("dubline.toml"));
                assert!(!force);
            }
            _ => panic!("expected config init"),
        }
    }
}
