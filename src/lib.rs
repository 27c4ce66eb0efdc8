//! dubline - Automated Dubbing Workflow
//!
//! Transcribes a video or audio source in silence-aware chunks, writes the
//! result as an SRT subtitle, synthesizes a narration timed to each caption
//! and re-muxes it into the source video using ffmpeg.

pub mod audio;
pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod media;
pub mod narration;
pub mod retry;
pub mod storage;
pub mod subtitle;
pub mod timeline;
pub mod transcribe;
pub mod workflow;
