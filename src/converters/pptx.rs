//! Slide deck (`.pptx`) → Markdown.
//!
//! One block per slide, in presentation order:
//!
//! ```text
//! ## <title or "Slide N">
//!
//! paragraph
//!   - nested paragraph (level 1)
//!
//! | table | ... |
//! ```
//!
//! Blocks are separated by `---`. The title placeholder supplies the heading
//! and is not repeated in the body. Grouped shapes are walked recursively.

use super::markdown::{pipe_table, render_runs, TextRun};
use super::ooxml::{child, children, parse_xml, toggle, OoxmlPackage, A_NS, P_NS, R_NS};
use super::Converter;
use crate::error::Doc2MdError;
use crate::normalize::normalize_markdown;
use crate::output::{FormatTag, MarkdownResult, RunId};
use once_cell::sync::Lazy;
use regex::Regex;
use roxmltree::Node;
use std::path::Path;
use tracing::{debug, info};

const SLIDE_SEPARATOR: &str = "\n\n---\n\n";

static RE_SLIDE_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap());

/// Converter for `.pptx` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PptxConverter;

impl Converter for PptxConverter {
    fn format(&self) -> FormatTag {
        FormatTag::SlideDeck
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        let mut package = OoxmlPackage::open(path, "pptx")?;
        let slide_parts = slide_order(&mut package)?;
        debug!(path = %path.display(), slides = slide_parts.len(), "Resolved slide order");

        let mut rendered = Vec::with_capacity(slide_parts.len());
        for (idx, part) in slide_parts.iter().enumerate() {
            let xml = package.require_part(part)?;
            rendered.push(render_slide(&xml, part, idx + 1)?);
        }

        info!(path = %path.display(), run_id = %run_id, slides = rendered.len(), "Converted pptx file");
        Ok(MarkdownResult::new(
            normalize_markdown(&rendered.join(SLIDE_SEPARATOR)),
            path,
            FormatTag::SlideDeck,
            run_id.clone(),
        ))
    }
}

/// Slide part names in presentation order.
///
/// `presentation.xml`'s `sldIdLst` is authoritative. Without it, slide parts
/// are ordered by the number in their file name.
fn slide_order(package: &mut OoxmlPackage) -> Result<Vec<String>, Doc2MdError> {
    if let Some(xml) = package.read_part("ppt/presentation.xml")? {
        let rels = package.relationships("ppt/presentation.xml")?;
        let doc = parse_xml(&xml, "ppt/presentation.xml")?;
        let ordered: Vec<String> = doc
            .descendants()
            .filter(|n| n.has_tag_name((P_NS, "sldId")))
            .filter_map(|n| n.attribute((R_NS, "id")))
            .filter_map(|rid| rels.get(rid).cloned())
            .collect();
        if !ordered.is_empty() {
            return Ok(ordered);
        }
    }

    let mut numbered: Vec<(u32, String)> = package
        .part_names()
        .into_iter()
        .filter_map(|name| {
            let n = RE_SLIDE_PART.captures(&name)?[1].parse().ok()?;
            Some((n, name))
        })
        .collect();
    numbered.sort();
    Ok(numbered.into_iter().map(|(_, name)| name).collect())
}

// ── Slide rendering ──────────────────────────────────────────────────────

enum SlideBlock {
    Line(String),
    Table(String),
}

fn render_slide(xml: &str, part: &str, number: usize) -> Result<String, Doc2MdError> {
    let doc = parse_xml(xml, part)?;
    let Some(tree) = doc.descendants().find(|n| n.has_tag_name((P_NS, "spTree"))) else {
        return Ok(format!("## Slide {number}"));
    };

    let mut title: Option<String> = None;
    let mut blocks = Vec::new();
    walk_shapes(tree, &mut title, &mut blocks);

    let header = match title {
        Some(t) => format!("## {t}"),
        None => format!("## Slide {number}"),
    };
    let body = join_slide_blocks(&blocks);
    Ok(if body.is_empty() {
        header
    } else {
        format!("{header}\n\n{body}")
    })
}

fn walk_shapes(container: Node<'_, '_>, title: &mut Option<String>, blocks: &mut Vec<SlideBlock>) {
    for shape in container.children().filter(Node::is_element) {
        match shape.tag_name().name() {
            "sp" => {
                let Some(tx_body) = child(shape, P_NS, "txBody") else {
                    continue;
                };
                if title.is_none() && is_title_placeholder(shape) {
                    let text = child_paragraphs(tx_body)
                        .map(|p| plain_text(p).trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ");
                    if !text.is_empty() {
                        *title = Some(text);
                    }
                    continue;
                }
                for p in child_paragraphs(tx_body) {
                    if let Some(line) = paragraph_line(p) {
                        blocks.push(SlideBlock::Line(line));
                    }
                }
            }
            "grpSp" => walk_shapes(shape, title, blocks),
            "graphicFrame" => {
                if let Some(tbl) = shape.descendants().find(|n| n.has_tag_name((A_NS, "tbl"))) {
                    let table = pipe_table(&table_rows(tbl));
                    if !table.is_empty() {
                        blocks.push(SlideBlock::Table(table));
                    }
                }
            }
            _ => {}
        }
    }
}

fn is_title_placeholder(sp: Node<'_, '_>) -> bool {
    child(sp, P_NS, "nvSpPr")
        .and_then(|nv| child(nv, P_NS, "nvPr"))
        .and_then(|nv| child(nv, P_NS, "ph"))
        .and_then(|ph| ph.attribute("type"))
        .is_some_and(|t| matches!(t, "title" | "ctrTitle"))
}

fn child_paragraphs<'a, 'i: 'a>(tx_body: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    children(tx_body, A_NS, "p")
}

/// Markdown line for a paragraph; `None` when it has no text.
fn paragraph_line(p: Node<'_, '_>) -> Option<String> {
    let level: usize = child(p, A_NS, "pPr")
        .and_then(|ppr| ppr.attribute("lvl"))
        .and_then(|l| l.parse().ok())
        .unwrap_or(0);
    let text = render_runs(&paragraph_runs(p));
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(if level > 0 {
        format!("{}- {text}", "  ".repeat(level))
    } else {
        text.to_string()
    })
}

fn paragraph_runs(p: Node<'_, '_>) -> Vec<TextRun> {
    p.children()
        .filter(Node::is_element)
        .filter_map(|n| match n.tag_name().name() {
            "r" | "fld" => {
                let rpr = child(n, A_NS, "rPr");
                let flag = |name: &str| {
                    rpr.and_then(|r| r.attribute(name))
                        .map(|v| toggle(Some(v)))
                        .unwrap_or(false)
                };
                Some(TextRun {
                    text: child(n, A_NS, "t")
                        .and_then(|t| t.text())
                        .unwrap_or("")
                        .to_string(),
                    bold: flag("b"),
                    italic: flag("i"),
                })
            }
            "br" => Some(TextRun::plain(" ")),
            _ => None,
        })
        .collect()
}

fn plain_text(p: Node<'_, '_>) -> String {
    paragraph_runs(p).into_iter().map(|r| r.text).collect()
}

/// Cell grid of a DrawingML table; merged cells repeat their origin's text.
fn table_rows(tbl: Node<'_, '_>) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for tr in children(tbl, A_NS, "tr") {
        let mut row: Vec<String> = Vec::new();
        for tc in children(tr, A_NS, "tc") {
            let text = if tc.attribute("hMerge").is_some_and(|v| toggle(Some(v))) {
                row.last().cloned().unwrap_or_default()
            } else if tc.attribute("vMerge").is_some_and(|v| toggle(Some(v))) {
                rows.last()
                    .and_then(|above| above.get(row.len()))
                    .cloned()
                    .unwrap_or_default()
            } else {
                child(tc, A_NS, "txBody")
                    .map(|body| {
                        child_paragraphs(body)
                            .map(|p| plain_text(p).trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default()
            };
            row.push(text);
        }
        rows.push(row);
    }
    rows
}

fn join_slide_blocks(blocks: &[SlideBlock]) -> String {
    let mut out = String::new();
    let mut prev_was_line: Option<bool> = None;
    for block in blocks {
        let (text, is_line) = match block {
            SlideBlock::Line(s) => (s, true),
            SlideBlock::Table(s) => (s, false),
        };
        if let Some(prev_line) = prev_was_line {
            out.push_str(if prev_line && is_line { "\n" } else { "\n\n" });
        }
        out.push_str(text);
        prev_was_line = Some(is_line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converters::ooxml::fixtures::write_package;

    const NS: &str = r#"xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main" xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships""#;

    fn title_shape(text: &str) -> String {
        format!(
            r#"<p:sp><p:nvSpPr><p:cNvPr id="1" name="Title"/><p:cNvSpPr/><p:nvPr><p:ph type="title"/></p:nvPr></p:nvSpPr><p:txBody><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:txBody></p:sp>"#
        )
    }

    fn body_shape(paras: &str) -> String {
        format!(r#"<p:sp><p:nvSpPr><p:cNvPr id="2" name="Body"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr><p:txBody>{paras}</p:txBody></p:sp>"#)
    }

    fn slide(shapes: &str) -> String {
        format!(r#"<p:sld {NS}><p:cSld><p:spTree>{shapes}</p:spTree></p:cSld></p:sld>"#)
    }

    fn deck(slides: &[String], order: &[usize]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let ids: String = order
            .iter()
            .map(|i| format!(r#"<p:sldId id="{}" r:id="rId{i}"/>"#, 255 + i))
            .collect();
        let presentation = format!(r#"<p:presentation {NS}><p:sldIdLst>{ids}</p:sldIdLst></p:presentation>"#);
        let rels: String = (1..=slides.len())
            .map(|i| format!(r#"<Relationship Id="rId{i}" Type="slide" Target="slides/slide{i}.xml"/>"#))
            .collect();
        let rels = format!(r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#);
        let names: Vec<String> = (1..=slides.len()).map(|i| format!("ppt/slides/slide{i}.xml")).collect();
        let mut parts: Vec<(&str, &str)> = vec![
            ("ppt/presentation.xml", presentation.as_str()),
            ("ppt/_rels/presentation.xml.rels", rels.as_str()),
        ];
        for (name, body) in names.iter().zip(slides) {
            parts.push((name.as_str(), body.as_str()));
        }
        write_package(&dir.path().join("deck.pptx"), &parts);
        dir
    }

    fn convert(dir: &tempfile::TempDir) -> String {
        PptxConverter
            .convert(&dir.path().join("deck.pptx"), &RunId::from("t"))
            .unwrap()
            .content
    }

    #[test]
    fn titles_levels_and_separators() {
        let s1 = slide(&format!(
            "{}{}",
            title_shape("Intro"),
            body_shape(r#"<a:p><a:r><a:t>Point one</a:t></a:r></a:p><a:p><a:pPr lvl="1"/><a:r><a:t>Detail</a:t></a:r></a:p><a:p><a:pPr lvl="2"/><a:r><a:t>Deeper</a:t></a:r></a:p>"#)
        ));
        let s2 = slide(&body_shape(r#"<a:p><a:r><a:t>Untitled body</a:t></a:r></a:p>"#));
        let dir = deck(&[s1, s2], &[1, 2]);
        assert_eq!(
            convert(&dir),
            "## Intro\n\nPoint one\n  - Detail\n    - Deeper\n\n---\n\n## Slide 2\n\nUntitled body\n"
        );
    }

    #[test]
    fn presentation_order_wins_over_file_names() {
        let s1 = slide(&title_shape("First file"));
        let s2 = slide(&title_shape("Second file"));
        let dir = deck(&[s1, s2], &[2, 1]);
        assert_eq!(convert(&dir), "## Second file\n\n---\n\n## First file\n");
    }

    #[test]
    fn emphasis_and_groups() {
        let group = format!(
            "<p:grpSp><p:nvGrpSpPr/><p:grpSpPr/>{}</p:grpSp>",
            body_shape(r#"<a:p><a:r><a:rPr b="1"/><a:t>Bold</a:t></a:r><a:r><a:t xml:space="preserve"> and </a:t></a:r><a:r><a:rPr i="1"/><a:t>italic</a:t></a:r><a:r><a:rPr b="1" i="1"/><a:t> both</a:t></a:r></a:p>"#)
        );
        let dir = deck(&[slide(&group)], &[1]);
        assert_eq!(convert(&dir), "## Slide 1\n\n**Bold** and *italic **both***\n");
    }

    #[test]
    fn slide_tables() {
        let frame = r#"<p:graphicFrame><a:graphic><a:graphicData><a:tbl>
            <a:tr><a:tc><a:txBody><a:p><a:r><a:t>K</a:t></a:r></a:p></a:txBody></a:tc><a:tc><a:txBody><a:p><a:r><a:t>V</a:t></a:r></a:p></a:txBody></a:tc></a:tr>
            <a:tr><a:tc><a:txBody><a:p><a:r><a:t>x|y</a:t></a:r></a:p></a:txBody></a:tc></a:tr>
        </a:tbl></a:graphicData></a:graphic></p:graphicFrame>"#;
        let dir = deck(&[slide(&format!("{}{}", title_shape("Data"), frame))], &[1]);
        assert_eq!(convert(&dir), "## Data\n\n| K | V |\n| --- | --- |\n| x\\|y |  |\n");
    }

    #[test]
    fn falls_back_to_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.pptx");
        let s10 = slide(&title_shape("Ten"));
        let s2 = slide(&title_shape("Two"));
        write_package(
            &path,
            &[("ppt/slides/slide10.xml", s10.as_str()), ("ppt/slides/slide2.xml", s2.as_str())],
        );
        let md = PptxConverter.convert(&path, &RunId::from("t")).unwrap().content;
        assert_eq!(md, "## Two\n\n---\n\n## Ten\n");
    }
}
