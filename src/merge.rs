//! Document assembly.
//!
//! [`PdfMerger`] concatenates PDFs in append order: the rendered message
//! first, then every collected attachment. Pages are never reordered.
//!
//! Each input is loaded and validated on [`PdfMerger::append`], so a corrupt
//! attachment is reported with its position before anything is written.
//! [`PdfMerger::write`] renumbers every input into one object space, keeps
//! the first catalog and page tree root, and re-parents every page to it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::error::MergeError;

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guards against cyclic `Parent` chains in malformed inputs.
const MAX_TREE_DEPTH: usize = 64;

/// Appends PDFs and writes them out as one document.
#[derive(Default)]
pub struct PdfMerger {
    documents: Vec<Document>,
}

enum Role {
    Catalog,
    Pages,
    Skip,
    Keep,
}

impl PdfMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the PDF at `path` and queues it after the previous inputs.
    pub fn append(&mut self, path: &Path) -> Result<(), MergeError> {
        let index = self.documents.len();
        let bytes = std::fs::read(path)?;
        let doc = Document::load_mem(&bytes).map_err(|e| MergeError::InvalidInput {
            index,
            reason: e.to_string(),
        })?;
        if doc.get_pages().is_empty() {
            return Err(MergeError::InvalidInput {
                index,
                reason: "document has no pages".to_string(),
            });
        }
        self.documents.push(doc);
        Ok(())
    }

    /// Writes the merged document to `out` and returns its page count.
    pub fn write(self, out: &Path) -> Result<u32, MergeError> {
        if self.documents.is_empty() {
            return Err(MergeError::Empty);
        }

        let mut merged = Document::with_version("1.5");
        let mut next_id = 1;
        let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();
        let mut catalog: Option<(ObjectId, Dictionary)> = None;
        let mut root: Option<(ObjectId, Dictionary)> = None;

        for mut doc in self.documents {
            doc.renumber_objects_with(next_id);
            next_id = doc.max_id + 1;

            for page_id in doc.get_pages().into_values() {
                pages.push((page_id, page_with_inherited(&doc, page_id)?));
            }

            for (id, object) in std::mem::take(&mut doc.objects) {
                match role(&object) {
                    Role::Catalog => {
                        if catalog.is_none() {
                            catalog = Some((id, dictionary_of(&object)?));
                        }
                    }
                    Role::Pages => {
                        if root.is_none() {
                            root = Some((id, dictionary_of(&object)?));
                        }
                    }
                    Role::Skip => {}
                    Role::Keep => {
                        merged.objects.insert(id, object);
                    }
                }
            }
        }

        let (catalog_id, mut catalog) =
            catalog.ok_or_else(|| MergeError::Structure("no document catalog".to_string()))?;
        let (root_id, mut root) =
            root.ok_or_else(|| MergeError::Structure("no page tree".to_string()))?;

        let page_count = pages.len() as u32;
        let kids: Vec<Object> = pages.iter().map(|(id, _)| Object::Reference(*id)).collect();
        for (id, mut page) in pages {
            page.set("Parent", root_id);
            merged.objects.insert(id, Object::Dictionary(page));
        }

        root.remove(b"Parent");
        for key in INHERITABLE {
            root.remove(key);
        }
        root.set("Kids", kids);
        root.set("Count", page_count as i64);
        merged.objects.insert(root_id, Object::Dictionary(root));

        catalog.set("Pages", root_id);
        catalog.remove(b"Outlines");
        merged.objects.insert(catalog_id, Object::Dictionary(catalog));
        merged.trailer.set("Root", catalog_id);

        merged.max_id = merged.objects.keys().map(|(id, _)| *id).max().unwrap_or(0);
        merged.renumber_objects();
        merged.compress();

        let mut file = BufWriter::new(File::create(out)?);
        merged
            .save_to(&mut file)
            .map_err(|e| MergeError::Structure(e.to_string()))?;
        file.flush()?;

        tracing::debug!(pages = page_count, "merged document written");
        Ok(page_count)
    }
}

fn role(object: &Object) -> Role {
    match object.type_name() {
        Ok(b"Catalog") => Role::Catalog,
        Ok(b"Pages") => Role::Pages,
        Ok(b"Page") | Ok(b"Outlines") | Ok(b"Outline") => Role::Skip,
        _ => Role::Keep,
    }
}

fn dictionary_of(object: &Object) -> Result<Dictionary, MergeError> {
    object
        .as_dict()
        .cloned()
        .map_err(|e| MergeError::Structure(e.to_string()))
}

/// The page dictionary with inherited attributes copied down, since the
/// intermediate page tree nodes are dropped.
fn page_with_inherited(doc: &Document, page_id: ObjectId) -> Result<Dictionary, MergeError> {
    let mut page = doc
        .get_dictionary(page_id)
        .map_err(|e| MergeError::Structure(e.to_string()))?
        .clone();

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut depth = 0;
    while let Some(node_id) = parent {
        depth += 1;
        if depth > MAX_TREE_DEPTH {
            break;
        }
        let Ok(node) = doc.get_dictionary(node_id) else {
            break;
        };
        for key in INHERITABLE {
            if !page.has(key) {
                if let Ok(value) = node.get(key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Ok(page)
}
