//! # mailbind
//!
//! Turns Outlook `.msg` reply threads into PDF documents.
//!
//! For every uploaded container the latest message of the thread is cut out
//! of the body, rendered to PDF, followed by any PDF attachments, and named
//! after the case reference it mentions (`DO24-00123.pdf`). Several
//! containers come back as one zip archive.
//!
//! ## Architecture
//!
//! ```text
//! upload ──► Workspace ──► BatchOrchestrator ──► per container:
//!                                 │                open (.msg)
//!                                 │                segment ─► identify
//!                                 │                render ─► collect ─► merge
//!                                 ▼
//!                     single PDF or zip archive ──► streamed response ──► release
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`error`] | Container- and request-level error kinds |
//! | [`mail`] | Mail-container reader (`.msg`) |
//! | [`workspace`] | Request-scoped directories with exactly-once cleanup |
//! | [`render`] | Markup to PDF (builtin layout or external command) |
//! | [`attachments`] | PDF attachment collection |
//! | [`merge`] | PDF concatenation |
//! | [`archive`] | Zip packaging of several documents |
//! | [`pipeline`] | One container, end to end |
//! | [`batch`] | Many containers, skip or abort on failure |
//! | [`server`] | HTTP upload endpoint |
//! | [`convert_cmd`] | `mailbind convert` |
//!
//! Text-only logic (thread segmentation, identifiers, markup) lives in the
//! `mailbind-core` crate.

pub mod archive;
pub mod attachments;
pub mod batch;
pub mod config;
pub mod convert_cmd;
pub mod error;
pub mod mail;
pub mod merge;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod workspace;
