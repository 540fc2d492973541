//! Batch orchestration.
//!
//! Drives the per-container [`Pipeline`] over every upload of one request,
//! inside that request's [`Workspace`], and packages what succeeded:
//!
//! ```text
//! Idle → Receiving → Processing → { Packaging | Failed } → Responding → CleanedUp
//! ```
//!
//! - Uploads without the container extension are skipped up front.
//! - A failing container is logged and left out (`on_error = "skip"`), or
//!   fails the whole request (`on_error = "abort"`). Containers already
//!   running are waited for before the error is returned; the rest are
//!   never started.
//! - Zero successes: [`BatchError::NoValidInput`].
//! - One success: the document itself. More: a zip archive.
//!
//! Containers run on the blocking pool, up to `batch.concurrency` at a time.
//! Results are consumed in upload order, and file names are allocated in that
//! order after every container has finished, so names do not depend on
//! scheduling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use mailbind_core::identifier::IdentifierAllocator;

use crate::archive::BatchArchive;
use crate::attachments::DOCUMENT_EXTENSION;
use crate::config::{has_extension, Config, FailurePolicy};
use crate::error::{BatchError, ContainerError, InputError};
use crate::pipeline::{Pipeline, ProcessedContainer};
use crate::workspace::Workspace;

/// Subdirectory of the workspace holding final documents.
pub const OUTPUT_DIR: &str = "documents";

/// One uploaded file, already stored in the workspace.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-supplied file name. Used for logging and the extension check.
    pub name: String,
    pub path: PathBuf,
}

/// A finished, named document.
#[derive(Debug, Clone)]
pub struct FinalDocument {
    /// Batch-unique file stem, e.g. `DO24-00123` or `email_3fa9c1`.
    pub identifier: String,
    /// `<identifier>.pdf`
    pub file_name: String,
    pub path: PathBuf,
    /// Upload it came from.
    pub source: String,
    pub pages: u32,
}

#[derive(Debug, Clone)]
pub enum BatchOutput {
    Single(FinalDocument),
    Archive {
        path: PathBuf,
        name: String,
        documents: Vec<FinalDocument>,
    },
}

impl BatchOutput {
    pub fn path(&self) -> &std::path::Path {
        match self {
            BatchOutput::Single(doc) => &doc.path,
            BatchOutput::Archive { path, .. } => path,
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            BatchOutput::Single(doc) => &doc.file_name,
            BatchOutput::Archive { name, .. } => name,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BatchOutput::Single(_) => "application/pdf",
            BatchOutput::Archive { .. } => "application/zip",
        }
    }

    pub fn documents(&self) -> &[FinalDocument] {
        match self {
            BatchOutput::Single(doc) => std::slice::from_ref(doc),
            BatchOutput::Archive { documents, .. } => documents,
        }
    }
}

/// An upload that produced no document.
#[derive(Debug, Clone)]
pub struct SkippedContainer {
    pub name: String,
    /// `"extension"` for rejected uploads, otherwise [`ContainerError::kind`].
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub output: BatchOutput,
    pub skipped: Vec<SkippedContainer>,
}

/// Request lifecycle, logged at debug level as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Receiving,
    Processing,
    Packaging,
    Failed,
    Responding,
    CleanedUp,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Idle => "idle",
            BatchState::Receiving => "receiving",
            BatchState::Processing => "processing",
            BatchState::Packaging => "packaging",
            BatchState::Failed => "failed",
            BatchState::Responding => "responding",
            BatchState::CleanedUp => "cleaned_up",
        }
    }

    /// Records that the request owning `workspace` entered this state.
    pub fn enter(self, workspace: &Workspace) -> Self {
        tracing::debug!(workspace = %workspace.id(), state = self.as_str(), "batch state");
        self
    }
}

pub struct BatchOrchestrator {
    pipeline: Arc<Pipeline>,
    extension: String,
    on_error: FailurePolicy,
    concurrency: usize,
    archive_name: String,
    fallback_prefix: String,
}

impl BatchOrchestrator {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::with_pipeline(Pipeline::from_config(config)?, config))
    }

    /// Uses `pipeline` with the batch, input and naming settings of `config`.
    pub fn with_pipeline(pipeline: Pipeline, config: &Config) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            extension: config.input.extension.clone(),
            on_error: config.batch.on_error,
            concurrency: config.batch.concurrency.max(1),
            archive_name: config.batch.archive_name.clone(),
            fallback_prefix: config.naming.fallback_prefix.clone(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Whether an upload named `name` is a mail container.
    fn accepts(&self, name: &str) -> bool {
        has_extension(name, &self.extension)
    }

    /// Processes `uploads` and packages the result inside `workspace`.
    ///
    /// The workspace is not released here; the caller does that once the
    /// output has been delivered.
    pub async fn run(
        &self,
        uploads: Vec<Upload>,
        workspace: &Workspace,
    ) -> Result<BatchReport, BatchError> {
        if uploads.is_empty() {
            BatchState::Failed.enter(workspace);
            return Err(InputError::NoFiles.into());
        }
        BatchState::Processing.enter(workspace);

        let mut skipped = Vec::new();
        let mut accepted = Vec::new();
        for upload in uploads {
            if self.accepts(&upload.name) {
                accepted.push(upload);
            } else {
                tracing::warn!(container = %upload.name, "skipping upload without .{} extension", self.extension);
                skipped.push(SkippedContainer {
                    name: upload.name,
                    kind: "extension",
                    reason: format!("not a .{} file", self.extension),
                });
            }
        }
        let attempted = accepted.len();
        if attempted == 0 {
            BatchState::Failed.enter(workspace);
            return Err(BatchError::NoValidInput { attempted });
        }

        // Set on the first failure under the abort policy. Containers not yet
        // started are passed over; those already running are awaited.
        let stop = Arc::new(AtomicBool::new(false));
        let mut results = stream::iter(accepted)
            .map(|upload| {
                let pipeline = Arc::clone(&self.pipeline);
                let ws = workspace.clone();
                let stop = Arc::clone(&stop);
                async move {
                    if stop.load(Ordering::SeqCst) {
                        return (upload, None);
                    }
                    let path = upload.path.clone();
                    let result = tokio::task::spawn_blocking(move || pipeline.process(&path, &ws))
                        .await
                        .unwrap_or_else(|e| {
                            Err(ContainerError::Io(std::io::Error::other(e.to_string())))
                        });
                    (upload, Some(result))
                }
            })
            .buffered(self.concurrency);

        let mut processed: Vec<(Upload, ProcessedContainer)> = Vec::new();
        let mut aborted: Option<BatchError> = None;
        while let Some((upload, result)) = results.next().await {
            let Some(result) = result else {
                continue;
            };
            if aborted.is_some() {
                continue;
            }
            match result {
                Ok(container) => processed.push((upload, container)),
                Err(err) => {
                    tracing::warn!(
                        container = %upload.name,
                        kind = err.kind(),
                        error = %err,
                        "container failed"
                    );
                    if self.on_error == FailurePolicy::Abort {
                        stop.store(true, Ordering::SeqCst);
                        aborted = Some(BatchError::Aborted {
                            name: upload.name,
                            source: err,
                        });
                        continue;
                    }
                    skipped.push(SkippedContainer {
                        name: upload.name,
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        drop(results);

        if let Some(err) = aborted {
            BatchState::Failed.enter(workspace);
            return Err(err);
        }

        if processed.is_empty() {
            BatchState::Failed.enter(workspace);
            return Err(BatchError::NoValidInput { attempted });
        }

        let documents = self.name_documents(processed, workspace).await?;
        let output = match <[FinalDocument; 1]>::try_from(documents) {
            Ok([doc]) => BatchOutput::Single(doc),
            Err(documents) => {
                BatchState::Packaging.enter(workspace);
                self.package(documents, workspace).await?
            }
        };

        Ok(BatchReport { output, skipped })
    }

    /// Gives each document its batch-unique name, in upload order.
    async fn name_documents(
        &self,
        processed: Vec<(Upload, ProcessedContainer)>,
        workspace: &Workspace,
    ) -> Result<Vec<FinalDocument>, BatchError> {
        let out_dir = workspace.dir().join(OUTPUT_DIR);
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut allocator = IdentifierAllocator::new(&self.fallback_prefix);
        let mut documents = Vec::with_capacity(processed.len());
        for (upload, container) in processed {
            let identifier = allocator.allocate(container.identifier.as_deref());
            let file_name = format!("{}.{}", identifier, DOCUMENT_EXTENSION);
            let path = out_dir.join(&file_name);
            tokio::fs::rename(&container.document, &path).await?;
            workspace.register_output(&path)?;

            tracing::info!(
                container = %upload.name,
                identifier = %identifier,
                pages = container.pages,
                attachments = container.attachments,
                "converted"
            );
            documents.push(FinalDocument {
                identifier,
                file_name,
                path,
                source: upload.name,
                pages: container.pages,
            });
        }
        Ok(documents)
    }

    async fn package(
        &self,
        documents: Vec<FinalDocument>,
        workspace: &Workspace,
    ) -> Result<BatchOutput, BatchError> {
        let path = workspace.dir().join(&self.archive_name);
        let mut archive = BatchArchive::new();
        for doc in &documents {
            archive.add_entry(&doc.path, &doc.file_name);
        }
        let out = path.clone();
        tokio::task::spawn_blocking(move || archive.finalize(&out))
            .await
            .map_err(|e| BatchError::Io(std::io::Error::other(e.to_string())))??;
        workspace.register_output(&path)?;

        Ok(BatchOutput::Archive {
            path,
            name: self.archive_name.clone(),
            documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::fixtures::build_msg;
    use mailbind_core::identifier::is_fallback;
    use std::io::Read;
    use tempfile::TempDir;

    fn upload(ws: &Workspace, name: &str, bytes: &[u8]) -> Upload {
        let path = ws.temp_path("upload", "msg");
        std::fs::write(&path, bytes).unwrap();
        Upload {
            name: name.to_string(),
            path,
        }
    }

    fn two_message_body(reply: &str) -> String {
        format!("From: Alice <alice@example.org>\n{}\n\nFrom: Bob\nOriginal.", reply)
    }

    fn orchestrator(config: &Config) -> BatchOrchestrator {
        BatchOrchestrator::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_fallback_name_for_single_container() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        // Markers at offset 0 and 120 of a 300-character body.
        let first = format!("From: a\n{}\n", "x".repeat(111));
        let second = format!("From: b\n{}", "y".repeat(172));
        let body = format!("{}{}", first, second);
        assert_eq!(body.len(), 300);

        let msg = build_msg(&body, "", &[]);
        let report = orchestrator(&Config::default())
            .run(vec![upload(&ws, "thread.msg", &msg)], &ws)
            .await
            .unwrap();

        let BatchOutput::Single(doc) = &report.output else {
            panic!("expected a single document");
        };
        assert!(is_fallback(&doc.identifier, "email"), "{}", doc.identifier);
        assert_eq!(doc.pages, 1);
        assert!(doc.path.is_file());
        assert_eq!(report.output.content_type(), "application/pdf");
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_identifier_names_the_document() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let msg = build_msg(&two_message_body("Ticket DO24-00123 resolved."), "", &[]);
        let report = orchestrator(&Config::default())
            .run(vec![upload(&ws, "a.msg", &msg)], &ws)
            .await
            .unwrap();
        assert_eq!(report.output.file_name(), "DO24-00123.pdf");
        assert_eq!(ws.outputs(), vec![report.output.path().to_path_buf()]);
    }

    #[tokio::test]
    async fn test_failed_container_is_skipped_and_rest_archived() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let good_a = build_msg(&two_message_body("First DO24-00001."), "", &[]);
        let broken = build_msg("From: only one message here", "", &[]);
        let good_b = build_msg(&two_message_body("Second DO24-00002."), "", &[]);

        let report = orchestrator(&Config::default())
            .run(
                vec![
                    upload(&ws, "a.msg", &good_a),
                    upload(&ws, "broken.msg", &broken),
                    upload(&ws, "b.msg", &good_b),
                ],
                &ws,
            )
            .await
            .unwrap();

        let BatchOutput::Archive { path, name, documents } = &report.output else {
            panic!("expected an archive");
        };
        assert_eq!(name, "documents.zip");
        assert_eq!(documents.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "broken.msg");
        assert_eq!(report.skipped[0].kind, "segmentation");

        let mut zip = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["DO24-00001.pdf", "DO24-00002.pdf"]);
        let mut head = [0u8; 5];
        zip.by_index(0).unwrap().read_exact(&mut head).unwrap();
        assert_eq!(&head, b"%PDF-");
    }

    #[tokio::test]
    async fn test_no_matching_extension_is_no_valid_input() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let err = orchestrator(&Config::default())
            .run(
                vec![upload(&ws, "notes.txt", b"hello"), upload(&ws, "mail.eml", b"x")],
                &ws,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NoValidInput { attempted: 0 }));
    }

    #[tokio::test]
    async fn test_no_uploads_is_an_input_error() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let err = orchestrator(&Config::default()).run(vec![], &ws).await.unwrap_err();
        assert!(matches!(err, BatchError::Input(InputError::NoFiles)));
    }

    #[tokio::test]
    async fn test_all_failures_is_no_valid_input() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let err = orchestrator(&Config::default())
            .run(vec![upload(&ws, "junk.msg", b"not a compound file")], &ws)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NoValidInput { attempted: 1 }));
    }

    #[tokio::test]
    async fn test_abort_policy_fails_on_first_error() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let good = build_msg(&two_message_body("ok"), "", &[]);
        let broken = build_msg("no markers at all", "", &[]);
        let err = orchestrator(&Config::default())
            .with_failure_policy(FailurePolicy::Abort)
            .run(
                vec![upload(&ws, "good.msg", &good), upload(&ws, "bad.msg", &broken)],
                &ws,
            )
            .await
            .unwrap_err();
        match err {
            BatchError::Aborted { name, source } => {
                assert_eq!(name, "bad.msg");
                assert_eq!(source.kind(), "segmentation");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_waits_for_running_containers() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let mut config = Config::default();
        config.batch.concurrency = 4;

        let long_reply = "line of a long reply\n".repeat(20_000);
        let slow = build_msg(&two_message_body(&long_reply), "", &[]);
        let mut uploads = vec![upload(&ws, "bad.msg", b"not a compound file")];
        for i in 0..3 {
            uploads.push(upload(&ws, &format!("slow-{}.msg", i), &slow));
        }

        let err = orchestrator(&config)
            .with_failure_policy(FailurePolicy::Abort)
            .run(uploads, &ws)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Aborted { ref name, .. } if name == "bad.msg"));

        // Every sibling that was started has finished writing.
        let merged = |dir: &std::path::Path| {
            std::fs::read_dir(dir)
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with("merged-")
                })
                .count()
        };
        assert_eq!(merged(ws.dir()), 3);

        assert!(ws.release());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(ws.temps().is_empty());
        assert!(!ws.dir().exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_processing_keeps_upload_order() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let mut config = Config::default();
        config.batch.concurrency = 4;

        let uploads: Vec<Upload> = (1..=6)
            .map(|i| {
                let msg = build_msg(&two_message_body(&format!("Ref DO24-0000{}", i)), "", &[]);
                upload(&ws, &format!("{}.msg", i), &msg)
            })
            .collect();
        let report = orchestrator(&config).run(uploads, &ws).await.unwrap();
        let names: Vec<&str> = report
            .output
            .documents()
            .iter()
            .map(|d| d.file_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "DO24-00001.pdf",
                "DO24-00002.pdf",
                "DO24-00003.pdf",
                "DO24-00004.pdf",
                "DO24-00005.pdf",
                "DO24-00006.pdf",
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_identifiers_get_suffixes() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let msg = build_msg(&two_message_body("DO24-00123 again"), "", &[]);
        let report = orchestrator(&Config::default())
            .run(vec![upload(&ws, "a.msg", &msg), upload(&ws, "b.msg", &msg)], &ws)
            .await
            .unwrap();
        let names: Vec<&str> = report
            .output
            .documents()
            .iter()
            .map(|d| d.file_name.as_str())
            .collect();
        assert_eq!(names, vec!["DO24-00123.pdf", "DO24-00123-2.pdf"]);
    }

    #[tokio::test]
    async fn test_release_after_batch_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let msg = build_msg(&two_message_body("DO24-00123"), "", &[]);
        orchestrator(&Config::default())
            .run(vec![upload(&ws, "a.msg", &msg)], &ws)
            .await
            .unwrap();
        assert!(ws.release());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
