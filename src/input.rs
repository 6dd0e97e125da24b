//! Source-file access: existence checks and byte reads with typed errors.
//!
//! Every converter reads through here so a vanished or unreadable file maps
//! to the same [`Doc2MdError`] regardless of format.

use crate::error::Doc2MdError;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Fail with `FileNotFound` unless `path` is an existing regular file.
pub fn ensure_exists(path: &Path) -> Result<(), Doc2MdError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(Doc2MdError::conversion_msg(format!(
            "'{}' is not a regular file",
            path.display()
        ))),
        Err(_) => Err(Doc2MdError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Open a source file for reading.
pub fn open_source(path: &Path) -> Result<File, Doc2MdError> {
    File::open(path).map_err(|e| map_io(path, e))
}

/// Read the whole source file into memory.
pub fn read_source(path: &Path) -> Result<Vec<u8>, Doc2MdError> {
    let mut file = open_source(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| map_io(path, e))?;
    debug!(path = %path.display(), bytes = buf.len(), "Read source file");
    Ok(buf)
}

/// Read and decode a text source.
pub fn read_source_text(path: &Path) -> Result<String, Doc2MdError> {
    let bytes = read_source(path)?;
    crate::normalize::decode_text(&bytes, path)
}

fn map_io(path: &Path, e: io::Error) -> Doc2MdError {
    match e.kind() {
        io::ErrorKind::NotFound => Doc2MdError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => Doc2MdError::conversion(format!("Cannot read file '{}'", path.display()), e),
    }
}
