//! Writing summaries out, as text and optionally as speech.

use std::time::Duration;

use async_openai::config::{Config as _, OpenAIConfig};
use clap::Args;
use serde::Serialize;

use crate::{
    llm_client::{
        classify_error_response, classify_transport_error, create_http_client,
        create_openai_config, parse_retry_after,
    },
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// The most characters the speech endpoint accepts in one request.
pub const MAX_SPEECH_CHARS: usize = 4096;

/// Write one summary per page, separated by newlines.
#[instrument(level = "debug", skip(summaries), fields(path = %path.display()))]
pub async fn write_text(summaries: &[String], path: &Path) -> Result<()> {
    tokio::fs::write(path, summaries.join("\n"))
        .await
        .with_context(|| format!("Failed to write summary to {:?}", path.display()))
}

/// Split `text` into chunks of at most `max_chars` characters, breaking at
/// whitespace.
///
/// Runs of whitespace become single spaces, which makes no difference to a
/// speech engine. A single word longer than `max_chars` is split wherever it
/// has to be.
pub fn chunk_for_speech(text: &str, max_chars: usize) -> Vec<String> {
    assert!(max_chars > 0, "max_chars must be positive");
    let mut chunks = vec![];
    let mut chunk = String::new();
    let mut chunk_chars = 0;

    for word in text.split_whitespace() {
        let word_chars = word.chars().count();
        let separator = usize::from(chunk_chars > 0);
        if chunk_chars + separator + word_chars <= max_chars {
            if separator == 1 {
                chunk.push(' ');
            }
            chunk.push_str(word);
            chunk_chars += separator + word_chars;
            continue;
        }

        if chunk_chars > 0 {
            chunks.push(std::mem::take(&mut chunk));
            chunk_chars = 0;
        }
        if word_chars <= max_chars {
            chunk.push_str(word);
            chunk_chars = word_chars;
        } else {
            let chars = word.chars().collect::<Vec<_>>();
            let mut pieces = chars.chunks(max_chars).peekable();
            while let Some(piece) = pieces.next() {
                let piece = piece.iter().collect::<String>();
                if pieces.peek().is_some() {
                    chunks.push(piece);
                } else {
                    chunk_chars = piece.chars().count();
                    chunk = piece;
                }
            }
        }
    }
    if chunk_chars > 0 {
        chunks.push(chunk);
    }
    chunks
}

/// Something which can read text aloud.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Convert at most [`MAX_SPEECH_CHARS`] characters of text to MP3 data.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Speech synthesis options.
#[derive(Args, Clone, Debug)]
pub struct SpeechOpts {
    /// The text-to-speech model to use with `--text-to-speech`.
    #[clap(long, default_value = "tts-1")]
    pub tts_model: String,

    /// The voice to use with `--text-to-speech`.
    #[clap(long, default_value = "alloy")]
    pub voice: String,
}

/// A request to `/audio/speech`.
#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// Speech synthesis using an OpenAI-compatible `/audio/speech` endpoint.
#[derive(Debug)]
pub struct OpenAiSpeech {
    config: OpenAIConfig,
    http: reqwest::Client,
    model: String,
    voice: String,
    timeout: Option<Duration>,
}

impl OpenAiSpeech {
    /// Create a new speech client.
    pub fn new(opts: &SpeechOpts, timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            config: create_openai_config()?,
            http: create_http_client()?,
            model: opts.tts_model.clone(),
            voice: opts.voice.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut req = self
            .http
            .post(self.config.url("/audio/speech"))
            .query(&self.config.query())
            .headers(self.config.headers())
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: "mp3",
            });
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, retry_after, &body))
                .context("Speech synthesis failed");
        }
        let audio = response.bytes().await.map_err(classify_transport_error)?;
        Ok(audio.to_vec())
    }
}

/// Read `text` aloud, and write the MP3 to `path`.
///
/// Long texts are sent in several pieces, and the MP3 segments are joined.
/// We only create `path` once every piece has been synthesized.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn synthesize_speech(
    ui: &Ui,
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    path: &Path,
) -> Result<()> {
    let chunks = chunk_for_speech(text, MAX_SPEECH_CHARS);
    if chunks.is_empty() {
        return Err(anyhow!(
            "The summary is empty, so there is nothing to convert to speech"
        ));
    }

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔊",
            msg: "Synthesizing speech",
            done_msg: "Synthesized speech",
        },
        chunks.len() as u64,
    );
    let mut audio = vec![];
    for (idx, chunk) in chunks.iter().enumerate() {
        let segment = synthesizer.synthesize(chunk).await.with_context(|| {
            format!("Failed to synthesize part {} of {}", idx + 1, chunks.len())
        })?;
        audio.extend_from_slice(&segment);
        pb.inc(1);
    }
    pb.finish_using_style();

    tokio::fs::write(path, &audio)
        .await
        .with_context(|| format!("Failed to write speech to {:?}", path.display()))
}
