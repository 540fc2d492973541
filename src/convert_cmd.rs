//! Local batch conversion (`mailbind convert`).
//!
//! Runs the same batch as the upload server, on files from disk, and copies
//! the result into an output directory.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::batch::{BatchOrchestrator, BatchState, Upload};
use crate::config::{has_extension, Config, FailurePolicy};
use crate::workspace::Workspace;

/// Converts `inputs` (files, or directories searched recursively for mail
/// containers) and writes the output into `output`.
///
/// With `split`, every final document is written on its own instead of the
/// single document or archive the server would return.
pub async fn run_convert(
    config: &Config,
    inputs: &[PathBuf],
    output: &Path,
    split: bool,
    on_error: Option<FailurePolicy>,
) -> Result<()> {
    let files = collect_inputs(inputs, &config.input.extension)?;
    if files.is_empty() {
        bail!("no input files found");
    }

    let mut batch = BatchOrchestrator::from_config(config)?;
    if let Some(policy) = on_error {
        batch = batch.with_failure_policy(policy);
    }

    let workspace = Workspace::acquire(&config.workspace.root)
        .with_context(|| format!("Failed to create workspace under {}", config.workspace.root.display()))?;
    BatchState::Receiving.enter(&workspace);

    let result = async {
        let uploads = stage(&files, &workspace, &config.input.extension)?;
        let report = batch.run(uploads, &workspace).await?;
        BatchState::Responding.enter(&workspace);

        std::fs::create_dir_all(output)
            .with_context(|| format!("Failed to create output directory: {}", output.display()))?;
        let written: Vec<(PathBuf, PathBuf)> = if split {
            report
                .output
                .documents()
                .iter()
                .map(|doc| (doc.path.clone(), output.join(&doc.file_name)))
                .collect()
        } else {
            vec![(
                report.output.path().to_path_buf(),
                output.join(report.output.file_name()),
            )]
        };
        for (from, to) in &written {
            std::fs::copy(from, to)
                .with_context(|| format!("Failed to write {}", to.display()))?;
            println!("wrote {}", to.display());
        }

        for skipped in &report.skipped {
            eprintln!("skipped {} ({}): {}", skipped.name, skipped.kind, skipped.reason);
        }
        println!("convert");
        println!("  converted: {}", report.output.documents().len());
        println!("  skipped: {}", report.skipped.len());
        Ok::<_, anyhow::Error>(())
    }
    .await;

    BatchState::CleanedUp.enter(&workspace);
    workspace.release();
    result
}

/// Expands directories into the mail containers they contain, in path order.
/// Plain file arguments are passed through whatever their extension.
fn collect_inputs(inputs: &[PathBuf], extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if has_extension(&name, extension) {
                    found.push(entry.path().to_path_buf());
                }
            }
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("input not found: {}", input.display());
        }
    }
    Ok(files)
}

/// Copies inputs into the workspace under generated names.
fn stage(files: &[PathBuf], workspace: &Workspace, extension: &str) -> Result<Vec<Upload>> {
    let ext = extension.trim_start_matches('.');
    let mut uploads = Vec::with_capacity(files.len());
    for file in files {
        let name = file.display().to_string();
        let stored_ext = if has_extension(&name, ext) { ext } else { "bin" };
        let path = workspace.temp_path("upload", stored_ext);
        std::fs::copy(file, &path).with_context(|| format!("Failed to read {}", name))?;
        uploads.push(Upload { name, path });
    }
    Ok(uploads)
}
