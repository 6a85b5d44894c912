//! Turning a PDF into page texts.
//!
//! We shell out to `ocrmypdf` to add a text layer to scanned pages, then to
//! `pdfinfo` and `pdftotext` to read it back one page at a time. Everything
//! here fails before we spend any money on the summarization service.

use clap::Args;
use serde::Serialize;

use crate::{
    file_type::ensure_pdf,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

mod ocr;
mod pdftotext;

/// The text of a PDF, one entry per page, in page order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Document {
    pages: Vec<String>,
}

impl Document {
    /// Create a document from page texts.
    pub fn new(pages: Vec<String>) -> Self {
        Self { pages }
    }

    /// Our pages.
    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    /// The number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Does this document have no pages at all?
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Something which can turn a PDF into a [`Document`].
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Extract the text of every page of the PDF at `path`.
    async fn extract(&self, path: &Path) -> Result<Document>;
}

/// Options for [`PdfPageSource`].
#[derive(Args, Clone, Debug)]
pub struct SourceOpts {
    /// Don't run `ocrmypdf`. Only use this for PDFs which already have a
    /// text layer on every page.
    #[clap(long)]
    pub skip_ocr: bool,
}

/// Our standard [`PageSource`], using `ocrmypdf` and `poppler-utils`.
pub struct PdfPageSource {
    ui: Ui,
    skip_ocr: bool,
}

impl PdfPageSource {
    /// Create a new page source.
    pub fn new(ui: Ui, opts: &SourceOpts) -> Self {
        Self {
            ui,
            skip_ocr: opts.skip_ocr,
        }
    }
}

#[async_trait]
impl PageSource for PdfPageSource {
    #[instrument(level = "debug", skip(self))]
    async fn extract(&self, path: &Path) -> Result<Document> {
        ensure_pdf(path)?;

        // OCR into a scratch directory. We never modify the input.
        let tmpdir = tempfile::TempDir::with_prefix("pdf-summarizer")
            .context("cannot create temporary directory")?;
        let pdf_path = if self.skip_ocr {
            path.to_owned()
        } else {
            let spinner = self.ui.new_spinner(&ProgressConfig {
                emoji: "🔍",
                msg: "Running OCR",
                done_msg: "Ran OCR",
            });
            let ocr_path = tmpdir.path().join("ocr.pdf");
            ocr::ocr_pdf(path, &ocr_path).await?;
            spinner.finish_using_style();
            ocr_path
        };

        let spinner = self.ui.new_spinner(&ProgressConfig {
            emoji: "📄",
            msg: "Extracting text",
            done_msg: "Extracted text",
        });
        let page_count = pdftotext::get_pdf_page_count(&pdf_path).await?;
        let pages = pdftotext::extract_pages(&pdf_path, page_count).await?;
        spinner.finish_with_message(format!("Extracted {page_count} pages"));
        info!(page_count, "Read {}", path.display());
        Ok(Document::new(pages))
    }
}
