//! Per-container pipeline.
//!
//! One uploaded container goes through, in order:
//!
//! 1. open: body, subject and attachments are read into memory;
//! 2. segment: the first message of the thread is cut out of the body;
//! 3. identify: a document identifier is looked up in the segment (then the subject);
//! 4. render: the segment becomes a PDF;
//! 5. collect: PDF attachments are written to the workspace;
//! 6. merge: rendered message + attachments, in that order.
//!
//! The pipeline is synchronous and only touches files inside the workspace
//! it is given. Choosing the final, batch-unique file name is left to the
//! batch orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mailbind_core::identifier::IdentifierExtractor;
use mailbind_core::segment::Segmenter;

use crate::attachments::{collect_documents, DOCUMENT_EXTENSION};
use crate::config::Config;
use crate::error::ContainerError;
use crate::mail::{MailReader, OutlookMsgReader};
use crate::merge::PdfMerger;
use crate::render::{render_segment, renderer_from_config, Renderer};
use crate::workspace::Workspace;

/// Result of one successful container.
#[derive(Debug, Clone)]
pub struct ProcessedContainer {
    /// Identifier found in the segment or subject, if any.
    pub identifier: Option<String>,
    /// Merged document, inside the workspace, under a temporary name.
    pub document: PathBuf,
    pub pages: u32,
    /// Number of attachments merged after the message.
    pub attachments: usize,
}

pub struct Pipeline {
    reader: Arc<dyn MailReader>,
    renderer: Arc<dyn Renderer>,
    segmenter: Segmenter,
    extractor: IdentifierExtractor,
    search_subject: bool,
}

impl Pipeline {
    pub fn new(
        reader: Arc<dyn MailReader>,
        renderer: Arc<dyn Renderer>,
        segmenter: Segmenter,
        extractor: IdentifierExtractor,
        search_subject: bool,
    ) -> Self {
        Self {
            reader,
            renderer,
            segmenter,
            extractor,
            search_subject,
        }
    }

    /// Builds the pipeline described by `config`, with the `.msg` reader.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let segmenter = Segmenter::new(&config.thread.marker)
            .map_err(|e| anyhow::anyhow!("thread.marker: {}", e))?;
        let extractor = IdentifierExtractor::new(&config.naming.identifier_pattern)?;
        Ok(Self::new(
            Arc::new(OutlookMsgReader),
            renderer_from_config(&config.render),
            segmenter,
            extractor,
            config.naming.search_subject,
        ))
    }

    /// Runs every step for the container at `path`.
    pub fn process(
        &self,
        path: &Path,
        workspace: &Workspace,
    ) -> Result<ProcessedContainer, ContainerError> {
        let mail = self.reader.open(path)?;

        let segment = self.segmenter.segment(&mail.body)?;
        let subject = (self.search_subject && !mail.subject.is_empty())
            .then_some(mail.subject.as_str());
        let identifier = self.extractor.extract(segment, subject);

        let rendered = workspace.temp_path("message", DOCUMENT_EXTENSION);
        render_segment(self.renderer.as_ref(), segment, &rendered)?;

        let attachments = collect_documents(&mail.attachments, workspace, DOCUMENT_EXTENSION)?;
        drop(mail);

        let mut merger = PdfMerger::new();
        merger.append(&rendered)?;
        for attachment in &attachments {
            merger.append(attachment)?;
        }
        let document = workspace.temp_path("merged", DOCUMENT_EXTENSION);
        let pages = merger.write(&document)?;

        Ok(ProcessedContainer {
            identifier,
            document,
            pages,
            attachments: attachments.len(),
        })
    }
}
