//! Batch archive.
//!
//! Collects final documents and packs them into one zip file. Entries are
//! written in the order they were added, and only their names (never the
//! workspace paths) end up in the archive.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::error::ArchiveError;

#[derive(Debug, Default)]
pub struct BatchArchive {
    entries: Vec<(PathBuf, String)>,
}

impl BatchArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the file at `path` under the entry name `name`.
    pub fn add_entry(&mut self, path: &Path, name: &str) {
        self.entries.push((path.to_path_buf(), name.to_string()));
    }

    /// Writes the archive to `out`, which must not exist yet.
    pub fn finalize(self, out: &Path) -> Result<(), ArchiveError> {
        let file = OpenOptions::new().write(true).create_new(true).open(out)?;
        let mut zip = zip::ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for (path, name) in &self.entries {
            zip.start_file(name.as_str(), options)?;
            let mut source = File::open(path)?;
            std::io::copy(&mut source, &mut zip)?;
        }
        let mut writer = zip.finish()?;
        std::io::Write::flush(&mut writer)?;

        tracing::debug!(entries = self.entries.len(), "archive written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_entries_keep_order_and_names() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("merged-1.pdf");
        let b = tmp.path().join("merged-2.pdf");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let mut archive = BatchArchive::new();
        archive.add_entry(&a, "DO24-00123.pdf");
        archive.add_entry(&b, "email_abc123.pdf");
        let out = tmp.path().join("documents.zip");
        archive.finalize(&out).unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut names = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            names.push((entry.name().to_string(), body));
        }
        assert_eq!(
            names,
            vec![
                ("DO24-00123.pdf".to_string(), "first".to_string()),
                ("email_abc123.pdf".to_string(), "second".to_string()),
            ]
        );
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("documents.zip");
        std::fs::write(&out, b"existing").unwrap();
        let err = BatchArchive::new().finalize(&out).unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}
