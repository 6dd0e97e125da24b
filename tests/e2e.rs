//! End-to-end tests for the PDF route against a real pdfium library.
//!
//! Gated behind `E2E_ENABLED` because they need libpdfium on the loader
//! path (or `PDFIUM_LIB_PATH`). The PDFs are generated on the fly, so no
//! fixture files are required.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium.so cargo test --test e2e -- --nocapture

use edgequake_doc2md::{
    ConversionConfig, ConversionProgressCallback, DevicePreference, Dispatcher, ErrorCode,
    FormatTag, OcrEngineKind,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────

macro_rules! e2e_skip_unless_enabled {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
    }};
}

/// Build a minimal PDF. `Some(text)` pages get one Helvetica line per
/// `\n`-separated entry; `None` pages have an empty content stream.
fn build_pdf(pages: &[Option<&str>]) -> Vec<u8> {
    let mut objects: Vec<String> = Vec::new();
    let page_ids: Vec<usize> = (0..pages.len()).map(|i| 4 + i * 2).collect();

    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    let kids: Vec<String> = page_ids.iter().map(|id| format!("{id} 0 R")).collect();
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        pages.len()
    ));
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    for (i, page) in pages.iter().enumerate() {
        let content_id = page_ids[i] + 1;
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 3 0 R >> >> /Contents {content_id} 0 R >>"
        ));
        let stream = match page {
            Some(text) => {
                let lines: Vec<String> = text
                    .lines()
                    .enumerate()
                    .map(|(n, line)| {
                        let escaped = line
                            .replace('\\', "\\\\")
                            .replace('(', "\\(")
                            .replace(')', "\\)");
                        format!("BT /F1 14 Tf 72 {} Td ({escaped}) Tj ET", 720 - n * 24)
                    })
                    .collect();
                lines.join("\n")
            }
            None => String::new(),
        };
        objects.push(format!(
            "<< /Length {} >>\nstream\n{stream}\nendstream",
            stream.len()
        ));
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }
    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for off in offsets {
        out.extend_from_slice(format!("{off:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}

fn write_pdf(dir: &Path, name: &str, pages: &[Option<&str>]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, build_pdf(pages)).unwrap();
    p
}

/// OCR engine that fails loudly: proves the text layer was used.
fn text_layer_only(cache: &Path) -> ConversionConfig {
    ConversionConfig::builder()
        .cache_dir(cache)
        .ocr_device(DevicePreference::Cpu)
        .ocr_engine(OcrEngineKind::Command {
            template: "false {input}".into(),
        })
        .build()
        .unwrap()
}

// ── Text-layer route ─────────────────────────────────────────────────────

#[tokio::test]
async fn text_layer_pdf_skips_recognition() {
    e2e_skip_unless_enabled!();
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(
        dir.path(),
        "report.pdf",
        &[
            Some("Quarterly results were strong across regions."),
            Some("Second page discusses the outlook for next year."),
        ],
    );

    let d = Dispatcher::new(text_layer_only(&dir.path().join("cache")));
    let r = d.convert(&pdf, None).await.expect("text layer conversion");

    assert_eq!(r.source_format, FormatTag::Pdf);
    assert!(r.content.starts_with("## Page 1\n\nQuarterly results"), "{}", r.content);
    assert!(r.content.contains("\n\n---\n\n## Page 2\n\nSecond page"));
    assert!(r.content.ends_with('\n') && !r.content.ends_with("\n\n"));
}

#[tokio::test]
async fn page_number_lines_are_stripped() {
    e2e_skip_unless_enabled!();
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(
        dir.path(),
        "numbered.pdf",
        &[Some("Body text with plenty of words on it.\nPage 1")],
    );
    let d = Dispatcher::new(text_layer_only(&dir.path().join("cache")));
    let r = d.convert(&pdf, None).await.unwrap();
    assert!(r.content.contains("Body text with plenty of words"));
    assert!(!r.content.lines().any(|l| l.trim() == "Page 1"), "{}", r.content);
}

// ── OCR fallback route ───────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn blank_pdf_falls_back_to_recognition() {
    e2e_skip_unless_enabled!();

    #[derive(Default)]
    struct Pages(AtomicUsize);
    impl ConversionProgressCallback for Pages {
        fn on_page_complete(&self, _page: usize, _total: usize, _chars: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(dir.path(), "scan.pdf", &[None, None]);
    let pages = Arc::new(Pages::default());
    let config = ConversionConfig::builder()
        .cache_dir(dir.path().join("cache"))
        .ocr_device(DevicePreference::Cpu)
        .render_scale(1.0)
        .ocr_engine(OcrEngineKind::Command {
            template: "echo RECOGNISED {input}".into(),
        })
        .progress_callback(pages.clone())
        .build()
        .unwrap();

    let r = Dispatcher::new(config).convert(&pdf, None).await.unwrap();
    assert!(r.content.starts_with("## Page 1\n\nRECOGNISED"), "{}", r.content);
    assert!(r.content.contains("## Page 2\n\nRECOGNISED"));
    assert_eq!(pages.0.load(Ordering::SeqCst), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_recognizer_surfaces_ocr_failed() {
    e2e_skip_unless_enabled!();
    let dir = tempfile::tempdir().unwrap();
    let pdf = write_pdf(dir.path(), "scan.pdf", &[None]);
    let d = Dispatcher::new(text_layer_only(&dir.path().join("cache")));
    let err = d.convert(&pdf, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OcrFailed);
    assert_eq!(err.payload().code, ErrorCode::OcrFailed);
}

// ── Broken input ─────────────────────────────────────────────────────────

#[tokio::test]
async fn unreadable_pdf_is_ocr_failed() {
    e2e_skip_unless_enabled!();
    let dir = tempfile::tempdir().unwrap();
    let pdf = dir.path().join("broken.pdf");
    std::fs::write(&pdf, b"%PDF-1.4\nthis is not a pdf body").unwrap();
    let d = Dispatcher::new(text_layer_only(&dir.path().join("cache")));
    let err = d.convert(&pdf, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OcrFailed);
}

#[tokio::test]
async fn repeated_pdf_is_served_from_content_cache() {
    e2e_skip_unless_enabled!();
    let dir = tempfile::tempdir().unwrap();
    let pages = [Some("A cached document with a real text layer.")];
    let a = write_pdf(dir.path(), "a.pdf", &pages);
    let b = write_pdf(dir.path(), "b.pdf", &pages);

    let d = Dispatcher::new(text_layer_only(&dir.path().join("cache")));
    let first = d.convert(&a, None).await.unwrap();
    let second = d.convert(&b, None).await.unwrap();
    assert_eq!(first.content, second.content);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(d.metrics().cache_hits, 1);
}

#[test]
fn generated_pdf_is_well_formed() {
    let bytes = build_pdf(&[Some("x (y)"), None]);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("%PDF-1.4"));
    assert!(text.contains("/Count 2"));
    assert!(text.contains(r"(x \(y\))"));
    assert!(text.trim_end().ends_with("%%EOF"));
}
