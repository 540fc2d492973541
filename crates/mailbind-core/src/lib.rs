//! # mailbind core
//!
//! Pure logic shared by the mailbind service and CLI: locating the reply
//! inside a concatenated message thread, deriving the document identifier
//! that names the output, and wrapping the reply in the markup handed to a
//! renderer.
//!
//! This crate performs no filesystem, network, or async I/O. Everything in
//! it is deterministic apart from the random fallback identifiers drawn by
//! [`identifier::IdentifierAllocator`].

pub mod identifier;
pub mod markup;
pub mod segment;
