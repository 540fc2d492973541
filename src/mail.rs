//! Mail-container access.
//!
//! A [`MailReader`] opens one uploaded container and materializes everything
//! the pipeline needs (body, subject, attachments) into a [`MailContainer`].
//! The underlying file handle is closed before `open` returns, so a container
//! never outlives the request that uploaded it.
//!
//! The default reader, [`OutlookMsgReader`], understands Outlook `.msg` files.
//! These are OLE compound documents in which every MAPI property is a stream
//! named `__substg1.0_<tag><type>`:
//!
//! | Property | Tag | Location |
//! |----------|-----|----------|
//! | Body | `1000` | root storage |
//! | Subject | `0037` | root storage |
//! | Attachment data | `3701` | `__attach_version1.0_#NNNNNNNN` |
//! | Long filename | `3707` | attachment storage |
//! | Short filename | `3704` | attachment storage |
//!
//! String properties come as `001F` (UTF-16LE) or `001E` (8-bit).

use std::io::{Read, Seek};
use std::path::Path;

use crate::error::MailError;

const PROP_BODY: &str = "1000";
const PROP_SUBJECT: &str = "0037";
const PROP_ATTACH_DATA: &str = "3701";
const PROP_ATTACH_LONG_NAME: &str = "3707";
const PROP_ATTACH_SHORT_NAME: &str = "3704";

const TYPE_UNICODE: &str = "001F";
const TYPE_STRING8: &str = "001E";
const TYPE_BINARY: &str = "0102";

const ATTACHMENT_STORAGE_PREFIX: &str = "__attach_version1.0_#";

/// Everything the pipeline reads from one uploaded container.
#[derive(Debug, Clone, Default)]
pub struct MailContainer {
    pub body: String,
    pub subject: String,
    /// Attachments in the order the container stores them.
    pub attachments: Vec<MailAttachment>,
}

/// One attachment. `data` is `None` for attachments without a binary
/// payload, such as embedded messages.
#[derive(Debug, Clone, Default)]
pub struct MailAttachment {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl MailAttachment {
    /// The long filename, or the short one when the long one is missing or blank.
    pub fn name(&self) -> Option<&str> {
        [self.long_name.as_deref(), self.short_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty())
    }
}

/// Opens mail containers. Failures are terminal for that container.
pub trait MailReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<MailContainer, MailError>;
}

/// Reader for Outlook `.msg` compound files.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutlookMsgReader;

impl MailReader for OutlookMsgReader {
    fn open(&self, path: &Path) -> Result<MailContainer, MailError> {
        let file = std::fs::File::open(path)?;
        self.read_from(file)
    }
}

impl OutlookMsgReader {
    /// Reads a `.msg` document from any seekable source.
    pub fn read_from<F: Read + Seek>(&self, inner: F) -> Result<MailContainer, MailError> {
        let mut comp = cfb::CompoundFile::open(inner).map_err(classify_open_error)?;

        let body = read_string_property(&mut comp, "", PROP_BODY)?.unwrap_or_default();
        let subject = read_string_property(&mut comp, "", PROP_SUBJECT)?.unwrap_or_default();

        let mut storages: Vec<String> = comp
            .read_root_storage()
            .filter(|e| e.is_storage() && e.name().starts_with(ATTACHMENT_STORAGE_PREFIX))
            .map(|e| e.name().to_string())
            .collect();
        // Fixed-width hex suffix, so lexical order is attachment order.
        storages.sort();

        let mut attachments = Vec::with_capacity(storages.len());
        for storage in &storages {
            let long_name = read_string_property(&mut comp, storage, PROP_ATTACH_LONG_NAME)?;
            let short_name = read_string_property(&mut comp, storage, PROP_ATTACH_SHORT_NAME)?;
            let data = read_stream(&mut comp, &property_path(storage, PROP_ATTACH_DATA, TYPE_BINARY))?;
            attachments.push(MailAttachment {
                long_name,
                short_name,
                data,
            });
        }

        tracing::debug!(
            body_chars = body.len(),
            attachments = attachments.len(),
            "opened mail container"
        );

        Ok(MailContainer {
            body,
            subject,
            attachments,
        })
    }
}

fn classify_open_error(err: std::io::Error) -> MailError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            MailError::Format(err.to_string())
        }
        _ => MailError::Io(err),
    }
}

fn property_path(storage: &str, tag: &str, ty: &str) -> String {
    if storage.is_empty() {
        format!("/__substg1.0_{}{}", tag, ty)
    } else {
        format!("/{}/__substg1.0_{}{}", storage, tag, ty)
    }
}

fn read_stream<F: Read + Seek>(
    comp: &mut cfb::CompoundFile<F>,
    path: &str,
) -> Result<Option<Vec<u8>>, MailError> {
    if !comp.is_stream(path) {
        return Ok(None);
    }
    let mut stream = comp.open_stream(path)?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Reads a string property, preferring the Unicode variant.
fn read_string_property<F: Read + Seek>(
    comp: &mut cfb::CompoundFile<F>,
    storage: &str,
    tag: &str,
) -> Result<Option<String>, MailError> {
    if let Some(raw) = read_stream(comp, &property_path(storage, tag, TYPE_UNICODE))? {
        return Ok(Some(decode_utf16le(&raw)));
    }
    if let Some(raw) = read_stream(comp, &property_path(storage, tag, TYPE_STRING8))? {
        return Ok(Some(decode_string8(&raw)));
    }
    Ok(None)
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string()
}

/// 8-bit strings are UTF-8 in practice; anything else is read as Latin-1.
fn decode_string8(raw: &[u8]) -> String {
    let text = match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    };
    text.trim_end_matches('\0').to_string()
}

/// In-memory `.msg` builder shared by unit tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};

    pub(crate) fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    pub(crate) type AttachmentFixture<'a> = (Option<&'a str>, Option<&'a str>, Option<&'a [u8]>);

    pub(crate) fn build_msg(body: &str, subject: &str, attachments: &[AttachmentFixture<'_>]) -> Vec<u8> {
        let mut comp = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
        comp.create_stream("/__substg1.0_1000001F")
            .unwrap()
            .write_all(&utf16(body))
            .unwrap();
        comp.create_stream("/__substg1.0_0037001E")
            .unwrap()
            .write_all(subject.as_bytes())
            .unwrap();
        for (i, (long, short, data)) in attachments.iter().enumerate() {
            let storage = format!("/__attach_version1.0_#{:08X}", i);
            comp.create_storage(&storage).unwrap();
            if let Some(long) = long {
                comp.create_stream(format!("{}/__substg1.0_3707001F", storage))
                    .unwrap()
                    .write_all(&utf16(long))
                    .unwrap();
            }
            if let Some(short) = short {
                comp.create_stream(format!("{}/__substg1.0_3704001F", storage))
                    .unwrap()
                    .write_all(&utf16(short))
                    .unwrap();
            }
            if let Some(data) = data {
                comp.create_stream(format!("{}/__substg1.0_37010102", storage))
                    .unwrap()
                    .write_all(data)
                    .unwrap();
            }
        }
        comp.flush().unwrap();
        comp.into_inner().into_inner()
    }
}
