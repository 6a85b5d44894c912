//! Text extraction with `pdfinfo` and `pdftotext` from `poppler-utils`.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// `pdftotext` ends every page with a form feed.
const PAGE_SEPARATOR: char = '\x0c';

/// Poppler error categories which mean we got no usable output, even if the
/// exit status says otherwise. "Syntax Error" lines are common in slightly
/// damaged PDFs and are harmless.
static POPPLER_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(Command Line Error|I/O Error|Permission Error)")
        .expect("failed to compile regex")
});

/// Get the number of pages in a PDF.
#[instrument(level = "debug")]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, Some(&*POPPLER_ERROR_REGEX))?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_page_count(&output).with_context(|| {
        format!("failed to get page count for {:?}", path.display())
    })
}

/// Parse the `Pages:` line of `pdfinfo` output.
fn parse_page_count(pdfinfo_output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in pdfinfo_output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("invalid page count {:?}", page_count_str))
}

/// Extract the text of every page of a PDF.
#[instrument(level = "debug")]
pub async fn extract_pages(path: &Path, page_count: usize) -> Result<Vec<String>> {
    let output = Command::new("pdftotext")
        .args(["-enc", "UTF-8"])
        .arg(path)
        .arg("-")
        .output()
        .await
        .with_context(|| format!("failed to run pdftotext on {:?}", path.display()))?;
    check_for_command_failure("pdftotext", &output, Some(&*POPPLER_ERROR_REGEX))?;

    let text = String::from_utf8_lossy(&output.stdout);
    split_pages(&text, page_count)
        .with_context(|| format!("failed to extract pages from {:?}", path.display()))
}

/// Split `pdftotext` output into exactly `page_count` pages.
///
/// We never return a partial document. Any disagreement with `pdfinfo` is
/// an error.
fn split_pages(text: &str, page_count: usize) -> Result<Vec<String>> {
    if page_count == 0 {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }
        return Err(anyhow!("PDF has no pages, but pdftotext returned text"));
    }

    let text = text.strip_suffix(PAGE_SEPARATOR).unwrap_or(text);
    let pages = text
        .split(PAGE_SEPARATOR)
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if pages.len() != page_count {
        return Err(anyhow!(
            "expected {} pages, but pdftotext returned {}",
            page_count,
            pages.len()
        ));
    }
    Ok(pages)
}
