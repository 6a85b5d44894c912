//! The `extract` subcommand.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    file_type::{FileKind, ensure_kind_by_name},
    prelude::*,
    source::{PageSource as _, PdfPageSource, SourceOpts},
    ui::Ui,
};

/// OCR a PDF and print the text of each page, without summarizing.
#[derive(Args, Debug)]
pub struct ExtractOpts {
    /// The PDF to read. It is never modified.
    pub input_pdf: PathBuf,

    /// Where to write a JSON array of page texts. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub source_opts: SourceOpts,
}

/// Run the `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input_pdf.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    if let Some(output_path) = &opts.output_path {
        ensure_kind_by_name(output_path, FileKind::Json)?;
    }

    let source = PdfPageSource::new(ui, &opts.source_opts);
    let document = source.extract(&opts.input_pdf).await?;
    let mut json =
        serde_json::to_string_pretty(&document).context("Failed to serialize pages")?;
    json.push('\n');

    match &opts.output_path {
        Some(output_path) => tokio::fs::write(output_path, json)
            .await
            .with_context(|| format!("Failed to write pages to {:?}", output_path.display())),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(json.as_bytes())
                .await
                .context("Failed to write pages to standard output")?;
            stdout.flush().await.context("Failed to flush standard output")
        }
    }
}
