//! Checking file types by name and by content.

use crate::prelude::*;

/// The kinds of file we read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Our input.
    Pdf,
    /// Our summary.
    Text,
    /// Our spoken summary.
    Mp3,
    /// Extracted pages, for debugging.
    Json,
}

impl FileKind {
    /// The MIME type we expect.
    pub fn mime_type(self) -> &'static str {
        match self {
            FileKind::Pdf => "application/pdf",
            FileKind::Text => "text/plain",
            FileKind::Mp3 => "audio/mpeg",
            FileKind::Json => "application/json",
        }
    }

    /// A human-readable description.
    fn description(self) -> &'static str {
        match self {
            FileKind::Pdf => "PDF",
            FileKind::Text => "text",
            FileKind::Mp3 => "audio",
            FileKind::Json => "JSON",
        }
    }
}

/// Guess a MIME type from a file name alone.
pub fn guess_mime_type_from_name(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_owned())
}

/// Does `path` have a name suitable for `kind`?
pub fn has_kind_by_name(path: &Path, kind: FileKind) -> bool {
    mime_guess::from_path(path)
        .iter()
        .any(|mime| mime.essence_str() == kind.mime_type())
}

/// Fail unless `path` has a name suitable for `kind`.
///
/// This doesn't touch the file system, so we can check output paths before
/// spending any money on API calls.
pub fn ensure_kind_by_name(path: &Path, kind: FileKind) -> Result<()> {
    if has_kind_by_name(path, kind) {
        Ok(())
    } else {
        Err(anyhow!(
            "{} is not a valid {} file (expected {}, but the name suggests {})",
            path.display(),
            kind.description(),
            kind.mime_type(),
            guess_mime_type_from_name(path).as_deref().unwrap_or("an unknown type"),
        ))
    }
}

/// Fail unless `path` looks like a PDF by both name and contents.
pub fn ensure_pdf(path: &Path) -> Result<()> {
    ensure_kind_by_name(path, FileKind::Pdf)?;
    let kind = infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?;
    match kind {
        Some(kind) if kind.mime_type() == FileKind::Pdf.mime_type() => Ok(()),
        Some(kind) => Err(anyhow!(
            "{} is not a valid PDF file (its contents look like {})",
            path.display(),
            kind.mime_type(),
        )),
        None => Err(anyhow!(
            "{} is not a valid PDF file (unrecognized contents)",
            path.display(),
        )),
    }
}
