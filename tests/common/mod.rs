//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use lopdf::content::Content;
use lopdf::{dictionary, Document, Stream};
use mailbind::render::{render_segment, BuiltinRenderer};

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Attachment as (file name, payload).
pub type Attachment<'a> = (&'a str, &'a [u8]);

/// Builds an Outlook `.msg` compound file in memory.
pub fn msg_bytes(body: &str, subject: &str, attachments: &[Attachment<'_>]) -> Vec<u8> {
    let mut comp = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
    comp.create_stream("/__substg1.0_1000001F")
        .unwrap()
        .write_all(&utf16(body))
        .unwrap();
    comp.create_stream("/__substg1.0_0037001F")
        .unwrap()
        .write_all(&utf16(subject))
        .unwrap();
    for (i, (name, data)) in attachments.iter().enumerate() {
        let storage = format!("/__attach_version1.0_#{:08X}", i);
        comp.create_storage(&storage).unwrap();
        comp.create_stream(format!("{}/__substg1.0_3707001F", storage))
            .unwrap()
            .write_all(&utf16(name))
            .unwrap();
        comp.create_stream(format!("{}/__substg1.0_37010102", storage))
            .unwrap()
            .write_all(data)
            .unwrap();
    }
    comp.flush().unwrap();
    comp.into_inner().into_inner()
}

/// A two-message thread whose latest message is `reply`.
pub fn thread(reply: &str) -> String {
    format!(
        "From: Alice Example <alice@example.org>\nSent: Monday\n\n{}\n\nFrom: Bob Example <bob@example.org>\nSent: Friday\n\nThe original question.",
        reply
    )
}

/// A one-page PDF whose only line is `text`.
pub fn pdf_bytes(text: &str) -> Vec<u8> {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("fixture.pdf");
    render_segment(&BuiltinRenderer::default(), text, &path).unwrap();
    std::fs::read(path).unwrap()
}

/// A one-page PDF carrying an extra `size`-byte image stream of noise, so the
/// merged output is large and does not shrink under compression.
pub fn pdf_with_payload(text: &str, size: usize) -> Vec<u8> {
    let mut doc = Document::load_mem(&pdf_bytes(text)).unwrap();
    let mut state = 0x2545_f491_u32;
    let noise: Vec<u8> = (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Filter" => "DCTDecode",
        },
        noise,
    ));
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

pub fn write_msg(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// First text line of every page.
pub fn page_heads(pdf: &[u8]) -> Vec<String> {
    let doc = Document::load_mem(pdf).unwrap();
    doc.get_pages()
        .values()
        .map(|&id| {
            let content = Content::decode(&doc.get_page_content(id).unwrap()).unwrap();
            content
                .operations
                .iter()
                .find(|op| op.operator == "Tj")
                .map(|op| String::from_utf8_lossy(op.operands[0].as_str().unwrap()).into_owned())
                .unwrap_or_default()
        })
        .collect()
}

/// Config text pointing the workspace root at `root`.
pub fn config_with_workspace(root: &Path, extra: &str) -> String {
    format!(
        "[workspace]\nroot = \"{}\"\n\n{}",
        root.display().to_string().replace('\\', "\\\\"),
        extra
    )
}
