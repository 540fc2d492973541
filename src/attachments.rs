//! Attachment collection.
//!
//! Picks the attachments that are already documents (by name, e.g. `*.pdf`)
//! and writes each one into the workspace so the merger can append it.

use std::io;
use std::path::PathBuf;

use crate::config::has_extension;
use crate::mail::MailAttachment;
use crate::workspace::Workspace;

/// Extension of attachments that are merged into the final document.
pub const DOCUMENT_EXTENSION: &str = "pdf";

/// Materializes every attachment whose name ends in `.<ext>` (any case).
///
/// Output order follows `attachments`. Attachments without a usable name,
/// without a payload, or with another extension are skipped silently.
pub fn collect_documents(
    attachments: &[MailAttachment],
    workspace: &Workspace,
    ext: &str,
) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for (index, attachment) in attachments.iter().enumerate() {
        let Some(name) = attachment.name() else {
            tracing::debug!(index, "skipping unnamed attachment");
            continue;
        };
        if !has_extension(name, ext) {
            continue;
        }
        let Some(data) = attachment.data.as_deref() else {
            tracing::debug!(index, "skipping attachment without payload");
            continue;
        };

        let path = workspace.temp_path("attachment", ext.trim_start_matches('.'));
        std::fs::write(&path, data)?;
        paths.push(path);
    }
    Ok(paths)
}
