//! The `summarize` subcommand.

use clap::Args;

use crate::{
    async_utils::CancelToken,
    config::PipelineOpts,
    drivers::LlmOpts,
    file_type::{FileKind, ensure_kind_by_name},
    pipeline::{SummaryResult, summarize_document},
    prelude::*,
    prompt::PromptTemplate,
    sink::{OpenAiSpeech, SpeechOpts, synthesize_speech, write_text},
    source::{PageSource as _, PdfPageSource, SourceOpts},
    ui::{ProgressConfig, Ui},
};

/// Summarize a PDF page by page.
#[derive(Args, Debug)]
pub struct SummarizeOpts {
    /// The PDF to summarize. It is never modified.
    pub input_pdf: PathBuf,

    /// Where to write the summary. Must be a `.txt` file.
    #[clap(short = 'o', long = "output-file", default_value = "output.txt")]
    pub output_path: PathBuf,

    /// Also read the summary aloud, and save it here. Must be an `.mp3` file.
    #[clap(short = 't', long = "text-to-speech", value_name = "MP3_FILE")]
    pub speech_path: Option<PathBuf>,

    #[clap(flatten)]
    pub source_opts: SourceOpts,

    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,

    #[clap(flatten)]
    pub speech_opts: SpeechOpts,
}

/// Run the `summarize` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input_pdf.display()))]
pub async fn cmd_summarize(ui: Ui, opts: &SummarizeOpts, cancel: CancelToken) -> Result<()> {
    // Check everything we can before we spend any money.
    ensure_kind_by_name(&opts.output_path, FileKind::Text)?;
    if let Some(speech_path) = &opts.speech_path {
        ensure_kind_by_name(speech_path, FileKind::Mp3)?;
    }
    let config = opts.pipeline_opts.to_config()?;
    debug!(
        worst_case_wait = ?config.retry_policy.worst_case_wait(),
        "Retry budget per page"
    );
    let template =
        PromptTemplate::from_optional_path(opts.pipeline_opts.prompt_template.as_deref())
            .await?;
    let driver = opts.llm_opts.driver.create_driver(&opts.llm_opts)?;
    let speech = match &opts.speech_path {
        Some(_) => Some(OpenAiSpeech::new(&opts.speech_opts, opts.llm_opts.timeout())?),
        None => None,
    };

    // Get our page texts.
    let source = PdfPageSource::new(ui.clone(), &opts.source_opts);
    let document = source.extract(&opts.input_pdf).await?;
    if document.is_empty() {
        warn!("{} has no pages", opts.input_pdf.display());
    }

    // Summarize.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📝",
            msg: "Summarizing pages",
            done_msg: "Summarized pages",
        },
        document.len() as u64,
    );
    let result = summarize_document(
        &document,
        &template,
        driver.as_ref(),
        &config,
        &cancel,
        &pb,
    )
    .await
    .with_context(|| format!("Failed to summarize {:?}", opts.input_pdf.display()))?;
    pb.finish_using_style();

    // Always save what we have, even if too many pages failed.
    write_text(&result.summaries, &opts.output_path).await?;
    report_result(&ui, &result, &opts.output_path);
    result.check_failure_rate(opts.pipeline_opts.allowed_failure_rate)?;

    if let (Some(speech), Some(speech_path)) = (&speech, &opts.speech_path) {
        synthesize_speech(&ui, speech, &result.summaries.join("\n"), speech_path).await?;
        ui.display_message("🔊", &format!("Wrote speech to {}", speech_path.display()));
    }
    Ok(())
}

/// Tell the user how things went.
fn report_result(ui: &Ui, result: &SummaryResult, output_path: &Path) {
    let stats = &result.stats;
    ui.display_message(
        "📄",
        &format!(
            "Wrote {} page summaries to {}",
            result.summaries.len(),
            output_path.display()
        ),
    );
    if !stats.token_usage.is_zero() {
        ui.display_message(
            "📈",
            &format!(
                "{} input tokens and {} output tokens used",
                stats.token_usage.prompt_tokens, stats.token_usage.completion_tokens,
            ),
        );
    }
    let retries = stats.attempts.saturating_sub(stats.summarized as u64);
    if retries > 0 {
        ui.display_message(
            "⏳",
            &format!(
                "Rate limited {} times, spent {:.0}s backing off",
                retries,
                stats.total_backoff.as_secs_f64()
            ),
        );
    }
    if stats.skipped > 0 {
        ui.display_message("⏭️", &format!("Skipped {} blank pages", stats.skipped));
    }
    if stats.failed > 0 {
        let pages = result
            .failures
            .iter()
            .map(|failure| format!("{} ({})", failure.page + 1, failure.error.kind()))
            .collect::<Vec<_>>()
            .join(", ");
        ui.display_message(
            "❌",
            &format!("{} pages could not be summarized: {}", stats.failed, pages),
        );
    }
}
