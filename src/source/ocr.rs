//! OCR with `ocrmypdf`.

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Add a text layer to any pages of `input` which lack one, writing the
/// result to `output`. Pages which already have text are left alone.
#[instrument(level = "debug")]
pub async fn ocr_pdf(input: &Path, output: &Path) -> Result<()> {
    let result = Command::new("ocrmypdf")
        .arg(input)
        .arg(output)
        .args(["--deskew", "--skip-text", "--quiet"])
        .output()
        .await
        .with_context(|| {
            format!(
                "failed to run ocrmypdf on {:?} (is it installed?)",
                input.display()
            )
        })?;
    check_for_command_failure("ocrmypdf", &result, None)
}
