//! Word-processing document (`.docx`) → Markdown.
//!
//! Walks `word/document.xml` body elements in document order:
//!
//! | Element | Output |
//! |---------|--------|
//! | paragraph with a `heading N` style | `#`×N heading (plain text) |
//! | paragraph with a `List Bullet`/`List Number` style or `w:numPr` | `- item` / `N. item`, indented two spaces per `ilvl` |
//! | other paragraph | inline Markdown with bold/italic |
//! | table | pipe table |
//!
//! Numbering counters are per list level; a deeper level restarts when a
//! shallower item appears, and any heading, table or non-list paragraph
//! clears every counter. Consecutive list items stay in one tight list.

use super::markdown::{pipe_table, render_runs, TextRun};
use super::ooxml::{child, children, parse_xml, toggle, OoxmlPackage, W_NS};
use super::Converter;
use crate::error::Doc2MdError;
use crate::normalize::normalize_markdown;
use crate::output::{FormatTag, MarkdownResult, RunId};
use roxmltree::Node;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// Converter for `.docx` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxConverter;

impl Converter for DocxConverter {
    fn format(&self) -> FormatTag {
        FormatTag::WordDocument
    }

    fn convert(&self, path: &Path, run_id: &RunId) -> Result<MarkdownResult, Doc2MdError> {
        let mut package = OoxmlPackage::open(path, "docx")?;
        let document = package.require_part("word/document.xml")?;
        let styles = package.read_part("word/styles.xml")?;
        let numbering = package.read_part("word/numbering.xml")?;

        let ctx = DocContext {
            style_names: styles
                .as_deref()
                .map(parse_style_names)
                .transpose()?
                .unwrap_or_default(),
            numbered: numbering
                .as_deref()
                .map(parse_numbering)
                .transpose()?
                .unwrap_or_default(),
        };

        let content = render_document(&document, &ctx)?;
        info!(path = %path.display(), run_id = %run_id, "Converted docx file");
        Ok(MarkdownResult::new(
            normalize_markdown(&content),
            path,
            FormatTag::WordDocument,
            run_id.clone(),
        ))
    }
}

// ── Styles and numbering ─────────────────────────────────────────────────

struct DocContext {
    /// styleId → display name, lower-cased ("heading 1", "list bullet").
    style_names: HashMap<String, String>,
    /// (numId, ilvl) → numbered (true) or bulleted (false).
    numbered: HashMap<(String, u32), bool>,
}

impl DocContext {
    fn style_name(&self, style_id: &str) -> String {
        self.style_names
            .get(style_id)
            .cloned()
            .unwrap_or_else(|| style_id.to_ascii_lowercase())
    }
}

fn parse_style_names(xml: &str) -> Result<HashMap<String, String>, Doc2MdError> {
    let doc = parse_xml(xml, "word/styles.xml")?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name((W_NS, "style")))
        .filter_map(|style| {
            let id = style.attribute((W_NS, "styleId"))?;
            let name = child(style, W_NS, "name")?.attribute((W_NS, "val"))?;
            Some((id.to_string(), name.to_ascii_lowercase()))
        })
        .collect())
}

fn parse_numbering(xml: &str) -> Result<HashMap<(String, u32), bool>, Doc2MdError> {
    let doc = parse_xml(xml, "word/numbering.xml")?;
    let root = doc.root_element();

    // abstractNumId → ilvl → numbered?
    let mut abstract_levels: HashMap<&str, HashMap<u32, bool>> = HashMap::new();
    for abs in children(root, W_NS, "abstractNum") {
        let Some(abs_id) = abs.attribute((W_NS, "abstractNumId")) else {
            continue;
        };
        let levels = children(abs, W_NS, "lvl")
            .filter_map(|lvl| {
                let ilvl = lvl.attribute((W_NS, "ilvl"))?.parse().ok()?;
                let fmt = child(lvl, W_NS, "numFmt")
                    .and_then(|f| f.attribute((W_NS, "val")))
                    .unwrap_or("decimal");
                Some((ilvl, !matches!(fmt, "bullet" | "none")))
            })
            .collect();
        abstract_levels.insert(abs_id, levels);
    }

    let mut out = HashMap::new();
    for num in children(root, W_NS, "num") {
        let Some(num_id) = num.attribute((W_NS, "numId")) else {
            continue;
        };
        let Some(levels) = child(num, W_NS, "abstractNumId")
            .and_then(|a| a.attribute((W_NS, "val")))
            .and_then(|id| abstract_levels.get(id))
        else {
            continue;
        };
        for (ilvl, numbered) in levels {
            out.insert((num_id.to_string(), *ilvl), *numbered);
        }
    }
    Ok(out)
}

// ── Body walk ────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Block {
    Text(String),
    ListItem(String),
    Table(String),
}

fn render_document(xml: &str, ctx: &DocContext) -> Result<String, Doc2MdError> {
    let doc = parse_xml(xml, "word/document.xml")?;
    let body = doc
        .descendants()
        .find(|n| n.has_tag_name((W_NS, "body")))
        .ok_or_else(|| Doc2MdError::conversion_msg("word/document.xml has no w:body"))?;

    let mut blocks = Vec::new();
    let mut counters = BTreeMap::new();
    walk_body(body, ctx, &mut counters, &mut blocks);
    debug!(blocks = blocks.len(), "Rendered docx body");
    Ok(join_blocks(&blocks))
}

fn walk_body(
    container: Node<'_, '_>,
    ctx: &DocContext,
    counters: &mut BTreeMap<u32, u32>,
    blocks: &mut Vec<Block>,
) {
    for node in container.children().filter(Node::is_element) {
        match node.tag_name().name() {
            "p" => render_paragraph(node, ctx, counters, blocks),
            "tbl" => {
                counters.clear();
                let table = pipe_table(&table_rows(node));
                if !table.is_empty() {
                    blocks.push(Block::Table(table));
                }
            }
            // Content controls wrap ordinary body content.
            "sdt" => {
                if let Some(content) = child(node, W_NS, "sdtContent") {
                    walk_body(content, ctx, counters, blocks);
                }
            }
            _ => {}
        }
    }
}

fn render_paragraph(
    p: Node<'_, '_>,
    ctx: &DocContext,
    counters: &mut BTreeMap<u32, u32>,
    blocks: &mut Vec<Block>,
) {
    let ppr = child(p, W_NS, "pPr");
    let style = ppr
        .and_then(|ppr| child(ppr, W_NS, "pStyle"))
        .and_then(|s| s.attribute((W_NS, "val")))
        .map(|id| ctx.style_name(id))
        .unwrap_or_default();

    if let Some(level) = heading_level(&style) {
        counters.clear();
        let text = plain_text(p);
        let text = text.trim();
        if !text.is_empty() {
            blocks.push(Block::Text(format!("{} {text}", "#".repeat(level))));
        }
        return;
    }

    if let Some((numbered, level)) = list_kind(&style, ppr, ctx) {
        let indent = "  ".repeat(level as usize);
        let text = render_runs(&paragraph_runs(p));
        let text = text.trim();
        if numbered {
            let n = counters.entry(level).or_insert(0);
            *n += 1;
            let n = *n;
            counters.retain(|&k, _| k <= level);
            blocks.push(Block::ListItem(format!("{indent}{n}. {text}")));
        } else {
            blocks.push(Block::ListItem(format!("{indent}- {text}")));
        }
        return;
    }

    counters.clear();
    let text = render_runs(&paragraph_runs(p));
    let text = text.trim();
    if !text.is_empty() {
        blocks.push(Block::Text(text.to_string()));
    }
}

/// `heading 1`..`heading 6` → 1..6. Also accepts bare style ids (`Heading2`).
fn heading_level(style: &str) -> Option<usize> {
    let rest = style.strip_prefix("heading")?.trim();
    match rest.parse::<usize>() {
        Ok(n @ 1..=6) => Some(n),
        _ => None,
    }
}

/// `(numbered, ilvl)` when the paragraph is a list item.
fn list_kind(style: &str, ppr: Option<Node<'_, '_>>, ctx: &DocContext) -> Option<(bool, u32)> {
    let num_pr = ppr.and_then(|ppr| child(ppr, W_NS, "numPr"));
    let level = num_pr
        .and_then(|n| child(n, W_NS, "ilvl"))
        .and_then(|l| l.attribute((W_NS, "val")))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if style.contains("list bullet") {
        return Some((false, level));
    }
    if style.contains("list number") {
        return Some((true, level));
    }

    let num_id = num_pr
        .and_then(|n| child(n, W_NS, "numId"))
        .and_then(|n| n.attribute((W_NS, "val")))?;
    // numId 0 explicitly removes numbering.
    if num_id == "0" {
        return None;
    }
    let numbered = ctx
        .numbered
        .get(&(num_id.to_string(), level))
        .copied()
        .unwrap_or(false);
    Some((numbered, level))
}

// ── Runs and text ────────────────────────────────────────────────────────

/// Formatted runs of a paragraph, descending into hyperlinks and tracked
/// insertions. Deleted text (`w:del`) is skipped.
fn paragraph_runs(p: Node<'_, '_>) -> Vec<TextRun> {
    let mut runs = Vec::new();
    collect_runs(p, &mut runs);
    runs
}

fn collect_runs(node: Node<'_, '_>, runs: &mut Vec<TextRun>) {
    for n in node.children().filter(Node::is_element) {
        match n.tag_name().name() {
            "r" => {
                let rpr = child(n, W_NS, "rPr");
                let prop = |name: &str| {
                    rpr.and_then(|rpr| child(rpr, W_NS, name))
                        .map(|p| toggle(p.attribute((W_NS, "val"))))
                        .unwrap_or(false)
                };
                runs.push(TextRun {
                    text: run_text(n),
                    bold: prop("b"),
                    italic: prop("i"),
                });
            }
            "hyperlink" | "ins" | "smartTag" | "fldSimple" => collect_runs(n, runs),
            _ => {}
        }
    }
}

fn run_text(r: Node<'_, '_>) -> String {
    let mut text = String::new();
    for n in r.children().filter(Node::is_element) {
        match n.tag_name().name() {
            "t" => text.push_str(n.text().unwrap_or("")),
            "tab" => text.push('\t'),
            "br" | "cr" => text.push(' '),
            _ => {}
        }
    }
    text
}

/// Unformatted paragraph text (headings, table cells).
fn plain_text(p: Node<'_, '_>) -> String {
    paragraph_runs(p).into_iter().map(|r| r.text).collect()
}

// ── Tables ───────────────────────────────────────────────────────────────

/// Cell grid of a table. Horizontally merged cells (`gridSpan`) repeat their
/// text across the spanned columns; vertically merged continuation cells
/// repeat the text of the cell above.
fn table_rows(tbl: Node<'_, '_>) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for tr in children(tbl, W_NS, "tr") {
        let mut row: Vec<String> = Vec::new();
        for tc in children(tr, W_NS, "tc") {
            let tc_pr = child(tc, W_NS, "tcPr");
            let span = tc_pr
                .and_then(|p| child(p, W_NS, "gridSpan"))
                .and_then(|g| g.attribute((W_NS, "val")))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(1)
                .max(1);
            let v_continue = tc_pr
                .and_then(|p| child(p, W_NS, "vMerge"))
                .is_some_and(|v| !matches!(v.attribute((W_NS, "val")), Some("restart")));

            let text = if v_continue {
                rows.last()
                    .and_then(|above| above.get(row.len()))
                    .cloned()
                    .unwrap_or_default()
            } else {
                children(tc, W_NS, "p")
                    .map(plain_text)
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            for _ in 0..span {
                row.push(text.clone());
            }
        }
        rows.push(row);
    }
    rows
}

fn join_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Block> = None;
    for block in blocks {
        if let Some(prev) = prev {
            let tight = matches!((prev, block), (Block::ListItem(_), Block::ListItem(_)));
            out.push_str(if tight { "\n" } else { "\n\n" });
        }
        match block {
            Block::Text(s) | Block::ListItem(s) | Block::Table(s) => out.push_str(s),
        }
        prev = Some(block);
    }
    out
}
