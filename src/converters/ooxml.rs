//! Office Open XML plumbing shared by the DOCX and PPTX converters.
//!
//! An OOXML file is a zip container of XML parts linked by relationship
//! parts (`_rels/*.rels`). This module opens the container, reads parts as
//! strings, resolves relationship targets, and offers a few `roxmltree`
//! helpers. Every failure becomes `ConversionFailed` with the zip/XML error
//! kept as its source.

use crate::error::Doc2MdError;
use crate::input;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

pub const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
pub const A_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
pub const P_NS: &str = "http://schemas.openxmlformats.org/presentationml/2006/main";
pub const R_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

/// Parts larger than this are refused (zip-bomb guard).
const MAX_PART_BYTES: u64 = 256 * 1024 * 1024;

/// An opened OOXML container.
pub struct OoxmlPackage {
    archive: ZipArchive<File>,
    path: PathBuf,
    kind: &'static str,
}

impl OoxmlPackage {
    /// Open `path` as a zip container. `kind` ("docx"/"pptx") only feeds
    /// error messages.
    pub fn open(path: &Path, kind: &'static str) -> Result<Self, Doc2MdError> {
        let file = input::open_source(path)?;
        let archive = ZipArchive::new(file).map_err(|e| {
            Doc2MdError::conversion(format!("Failed to open {kind}: '{}'", path.display()), e)
        })?;
        Ok(Self {
            archive,
            path: path.to_path_buf(),
            kind,
        })
    }

    /// Read a part as UTF-8 text. `Ok(None)` when the part is absent.
    pub fn read_part(&mut self, name: &str) -> Result<Option<String>, Doc2MdError> {
        let (kind, path) = (self.kind, self.path.as_path());
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(part_error(kind, path, name, e)),
        };
        if entry.size() > MAX_PART_BYTES {
            return Err(Doc2MdError::conversion_msg(format!(
                "{kind} part '{name}' is {} bytes, refusing to inflate",
                entry.size()
            )));
        }
        // The declared size is only a hint; the inflated stream is capped too.
        let bytes = read_capped(&mut entry, MAX_PART_BYTES)
            .map_err(|e| part_error(kind, path, name, e))?
            .ok_or_else(|| {
                Doc2MdError::conversion_msg(format!(
                    "{kind} part '{name}' inflates past {MAX_PART_BYTES} bytes, refusing to read"
                ))
            })?;
        let text = String::from_utf8(bytes).map_err(|e| part_error(kind, path, name, e))?;
        Ok(Some(text))
    }

    /// Read a part that must exist.
    pub fn require_part(&mut self, name: &str) -> Result<String, Doc2MdError> {
        self.read_part(name)?.ok_or_else(|| {
            Doc2MdError::conversion_msg(format!(
                "Failed to open {}: '{}' has no '{name}' part",
                self.kind,
                self.path.display()
            ))
        })
    }

    /// All part names in the container.
    pub fn part_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    /// Relationship id → resolved part name for the rels of `part`.
    ///
    /// `ppt/presentation.xml` reads `ppt/_rels/presentation.xml.rels` and
    /// resolves `slides/slide1.xml` to `ppt/slides/slide1.xml`.
    pub fn relationships(&mut self, part: &str) -> Result<HashMap<String, String>, Doc2MdError> {
        let (dir, file) = match part.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", part),
        };
        let rels_name = if dir.is_empty() {
            format!("_rels/{file}.rels")
        } else {
            format!("{dir}/_rels/{file}.rels")
        };
        let Some(xml) = self.read_part(&rels_name)? else {
            return Ok(HashMap::new());
        };
        let doc = parse_xml(&xml, &rels_name)?;
        Ok(doc
            .descendants()
            .filter(|n| n.has_tag_name((PKG_REL_NS, "Relationship")))
            .filter(|n| n.attribute("TargetMode") != Some("External"))
            .filter_map(|n| {
                let id = n.attribute("Id")?;
                let target = n.attribute("Target")?;
                Some((id.to_string(), resolve_target(dir, target)))
            })
            .collect())
    }
}

/// Read at most `limit` bytes; `Ok(None)` when the reader has more.
fn read_capped(reader: impl Read, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    reader.take(limit + 1).read_to_end(&mut buf)?;
    Ok((buf.len() as u64 <= limit).then_some(buf))
}

fn part_error<E>(kind: &str, path: &Path, name: &str, e: E) -> Doc2MdError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Doc2MdError::conversion(
        format!("Failed to read {kind} part '{name}' from '{}'", path.display()),
        e,
    )
}

/// Resolve a relationship target relative to the source part's directory.
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Parse a part, mapping XML errors to `ConversionFailed`.
pub fn parse_xml<'a>(xml: &'a str, part: &str) -> Result<roxmltree::Document<'a>, Doc2MdError> {
    roxmltree::Document::parse(xml)
        .map_err(|e| Doc2MdError::conversion(format!("Malformed XML in part '{part}'"), e))
}

/// First child element with the given namespaced name.
pub fn child<'a, 'i>(
    node: roxmltree::Node<'a, 'i>,
    ns: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'i>> {
    node.children().find(|n| n.has_tag_name((ns, name)))
}

/// Child elements with the given namespaced name.
pub fn children<'a, 'i: 'a>(
    node: roxmltree::Node<'a, 'i>,
    ns: &'a str,
    name: &'a str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'i>> + 'a {
    node.children().filter(move |n| n.has_tag_name((ns, name)))
}

/// OOXML on/off property: present without a value means on; `0`, `false`
/// and `off` mean off.
pub fn toggle(val: Option<&str>) -> bool {
    !matches!(val, Some("0") | Some("false") | Some("off") | Some("none"))
}
