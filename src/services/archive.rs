/// Random-access reads over a ZIP-packed book archive.
///
/// The EPUB reader only ever needs named-entry lookups, so the surface is a
/// small trait with a zip-backed implementation; tests substitute in-memory
/// archives through the same trait.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Mutex;

use zip::ZipArchive;

use crate::error::{ConversionError, Result};

pub trait BookArchive: Send {
    fn entry_bytes(&self, path: &str) -> Result<Vec<u8>>;

    fn entry_string(&self, path: &str) -> Result<String> {
        let bytes = self.entry_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|e| ConversionError::InvalidArchive(format!("{path} is not UTF-8: {e}")))
    }

    fn has_entry(&self, path: &str) -> bool;
}

#[derive(Debug)]
pub struct ZipBookArchive {
    // by_name needs &mut; the archive is shared read-only otherwise.
    zip: Mutex<ZipArchive<BufReader<File>>>,
}

impl ZipBookArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ConversionError::io(path, e))?;
        let zip = ZipArchive::new(BufReader::new(file))
            .map_err(|e| ConversionError::InvalidArchive(e.to_string()))?;
        Ok(ZipBookArchive {
            zip: Mutex::new(zip),
        })
    }
}

impl BookArchive for ZipBookArchive {
    fn entry_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut zip = self.zip.lock().expect("archive lock poisoned");
        let mut entry = zip
            .by_name(path)
            .map_err(|e| ConversionError::InvalidArchive(format!("failed to load {path}: {e}")))?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| ConversionError::InvalidArchive(format!("failed to read {path}: {e}")))?;
        Ok(buf)
    }

    fn has_entry(&self, path: &str) -> bool {
        self.zip
            .lock()
            .expect("archive lock poisoned")
            .index_for_name(path)
            .is_some()
    }
}
