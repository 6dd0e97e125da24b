//! CLI binary for edgequake-doc2md.
//!
//! A thin shim over the library crate that maps CLI flags onto
//! `ConversionConfig` and prints results or error payloads.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_doc2md::{
    convert_stream, ConversionConfig, ConversionProgressCallback, ConvertFailure, DevicePreference,
    Dispatcher, MarkdownResult, OcrEngineKind, ProgressCallback, RunId,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

fn bar_style(unit: &str) -> ProgressStyle {
    ProgressStyle::with_template(&format!(
        "{{spinner:.cyan}} {{prefix:.bold}}  [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  ⏱ {{elapsed_precise}}"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS)
}

// ── OCR page progress (single document) ──────────────────────────────────

/// Page-level bar for PDF/image OCR passes. Stays hidden for formats that
/// never report progress.
struct PageProgress {
    bar: ProgressBar,
}

impl PageProgress {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: ProgressBar::hidden(),
        })
    }
}

impl ConversionProgressCallback for PageProgress {
    fn on_conversion_start(&self, total_pages: usize) {
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(bar_style("pages"));
        self.bar.set_prefix("Recognising");
        self.bar.enable_steady_tick(Duration::from_millis(80));
    }

    fn on_text_layer_checked(&self, accepted: bool) {
        if accepted {
            self.bar.println(format!("  {} embedded text layer used", green("✓")));
        }
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, chars: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            page_num,
            total_pages,
            dim(&format!("{chars:>5} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page_num,
            total_pages,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, _total_pages: usize, _pages_with_text: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one file to stdout
  doc2md report.docx

  # Convert to a file
  doc2md slides.pptx -o slides.md

  # Convert many files into a directory
  doc2md notes.txt scan.pdf photo.png -o out/

  # JSON result (or error payload) with a caller-chosen run id
  doc2md --json --run-id job-42 scan.pdf

  # Recall what a run produced
  doc2md --recall job-42

  # Force CPU recognition / use a vision LLM instead of tesseract
  doc2md --ocr-device cpu scan.pdf
  doc2md --ocr-engine vision --model gpt-4.1-mini scan.pdf

  # Report whether a GPU is usable for OCR
  doc2md --probe-gpu

ENVIRONMENT VARIABLES:
  DOC2MD_CACHE_DIR               Cache root (default: <user cache dir>/doc2md)
  DOC2MD_NO_CACHE                Disable both cache namespaces when truthy
  DOC2MD_PDF_RENDER_SCALE        PDF rasterisation scale (default 300/72)
  DOC2MD_OCR_DEVICE              auto | gpu | cpu
  DOC2MD_OCR_ENGINE              command | vision
  DOC2MD_OCR_COMMAND             OCR command template (default: tesseract {input} stdout)
  DOC2MD_GPU_PROBE_TTL_SECONDS   GPU probe cache lifetime (default 300)
  PDFIUM_LIB_PATH                Path to an existing libpdfium
  OPENAI_API_KEY / EDGEQUAKE_LLM_PROVIDER / EDGEQUAKE_MODEL   Vision engine provider
"#;

/// Convert documents to normalized Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "doc2md",
    version,
    about = "Convert text, Markdown, Word, PowerPoint, PDF and image files to Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Files to convert.
    #[arg(required_unless_present_any = ["recall", "probe_gpu"])]
    inputs: Vec<PathBuf>,

    /// Output file (one input) or directory (several inputs).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print results as JSON; failures print the error payload.
    #[arg(long)]
    json: bool,

    /// Run id for this invocation (single input only). Default: random UUID.
    #[arg(long)]
    run_id: Option<String>,

    /// Bypass both cache namespaces.
    #[arg(long)]
    no_cache: bool,

    /// Cache root directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// PDF rasterisation scale factor (1.0 = 72 DPI).
    #[arg(long)]
    render_scale: Option<f32>,

    /// Recognition device: auto, gpu, cpu.
    #[arg(long)]
    ocr_device: Option<DevicePreference>,

    /// Recognition engine.
    #[arg(long, value_enum)]
    ocr_engine: Option<EngineArg>,

    /// Command template for the command engine; must contain {input}.
    #[arg(long)]
    ocr_command: Option<String>,

    /// Vision engine provider (openai, anthropic, gemini, ollama, ...).
    #[arg(long)]
    provider: Option<String>,

    /// Vision engine model id.
    #[arg(long)]
    model: Option<String>,

    /// Parallel conversions when several inputs are given.
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// Probe GPU availability (fresh), print the result and exit.
    #[arg(long)]
    probe_gpu: bool,

    /// Print the cached result of a previous run and exit.
    #[arg(long, value_name = "RUN_ID")]
    recall: Option<String>,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EngineArg {
    Command,
    Vision,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let page_progress = (show_progress && cli.inputs.len() == 1)
        .then(|| PageProgress::new() as ProgressCallback);
    let config = build_config(&cli, page_progress)?;
    let dispatcher = Dispatcher::new(config);

    // ── One-shot modes ───────────────────────────────────────────────────
    if cli.probe_gpu {
        let available = dispatcher.probe().is_gpu_available(true);
        if cli.json {
            println!("{}", serde_json::json!({ "gpuAvailable": available }));
        } else {
            println!("GPU available: {}", if available { "yes" } else { "no" });
        }
        return Ok(());
    }

    if let Some(ref run_id) = cli.recall {
        let Some(result) = dispatcher.lookup_run(&RunId::from(run_id.as_str())) else {
            bail!("No cached result for run '{run_id}'");
        };
        return emit(&cli, &result);
    }

    // ── Convert ──────────────────────────────────────────────────────────
    dispatcher.probe().warm_up();
    if cli.inputs.len() == 1 {
        convert_one(&cli, &dispatcher).await
    } else {
        convert_many(&cli, &dispatcher, show_progress).await
    }
}

async fn convert_one(cli: &Cli, dispatcher: &Dispatcher) -> Result<()> {
    let input = &cli.inputs[0];
    let run_id = cli.run_id.as_deref().map(RunId::from);

    let outcome = match &cli.output {
        Some(out) => dispatcher.convert_to_file(input, out, run_id).await,
        None => dispatcher.convert(input, run_id).await,
    };

    match outcome {
        Ok(result) => {
            if let Some(out) = &cli.output {
                if !cli.quiet {
                    eprintln!(
                        "{}  {}  →  {}  {}",
                        green("✔"),
                        input.display(),
                        bold(&out.display().to_string()),
                        dim(&format!("run {}", result.run_id)),
                    );
                }
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Ok(())
            } else {
                emit(cli, &result)
            }
        }
        Err(failure) => report_failure(cli, &failure),
    }
}

async fn convert_many(cli: &Cli, dispatcher: &Dispatcher, show_progress: bool) -> Result<()> {
    if cli.run_id.is_some() {
        bail!("--run-id applies to a single input; batch runs get one id per file");
    }
    let out_dir = match (&cli.output, cli.json) {
        (Some(dir), _) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
            Some(dir.clone())
        }
        (None, true) => None,
        (None, false) => bail!("Several inputs need --output <DIR> or --json"),
    };

    let bar = if show_progress {
        let bar = ProgressBar::new(cli.inputs.len() as u64);
        bar.set_style(bar_style("files"));
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut stream = convert_stream(dispatcher, cli.inputs.clone());
    let mut results = Vec::new();
    let mut failures = 0usize;

    while let Some(item) = stream.next().await {
        match item {
            Ok(result) => {
                if let Some(dir) = &out_dir {
                    let target = dir.join(output_name(&result.source_path));
                    write_markdown(&target, &result.content).await?;
                    bar.println(format!(
                        "  {} {}  →  {}",
                        green("✓"),
                        result.source_path.display(),
                        target.display()
                    ));
                }
                results.push(serde_json::to_value(&result)?);
            }
            Err(failure) => {
                failures += 1;
                bar.println(format!("  {} {}", red("✗"), red(&failure.to_string())));
                results.push(serde_json::to_value(failure.payload())?);
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    if !cli.quiet {
        let done = cli.inputs.len() - failures;
        eprintln!(
            "{} {}/{} files converted",
            if failures == 0 { green("✔") } else { red("✘") },
            bold(&done.to_string()),
            cli.inputs.len()
        );
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Map CLI args onto the environment-derived `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let base = ConversionConfig::from_env();
    let mut engine = base.ocr_engine.clone();
    let mut builder = base.into_builder().concurrency(cli.concurrency);

    if cli.no_cache {
        builder = builder.cache_enabled(false);
    }
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if let Some(scale) = cli.render_scale {
        builder = builder.render_scale(scale);
    }
    if let Some(device) = cli.ocr_device {
        builder = builder.ocr_device(device);
    }

    match cli.ocr_engine {
        Some(EngineArg::Vision) => {
            engine = OcrEngineKind::Vision {
                provider: None,
                model: None,
            }
        }
        Some(EngineArg::Command) if !matches!(engine, OcrEngineKind::Command { .. }) => {
            engine = OcrEngineKind::default()
        }
        _ => {}
    }
    match &mut engine {
        OcrEngineKind::Command { template } => {
            if let Some(ref cmd) = cli.ocr_command {
                *template = cmd.clone();
            }
        }
        OcrEngineKind::Vision { provider, model } => {
            if cli.provider.is_some() {
                *provider = cli.provider.clone();
            }
            if cli.model.is_some() {
                *model = cli.model.clone();
            }
        }
    }
    builder = builder.ocr_engine(engine);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn emit(cli: &Cli, result: &MarkdownResult) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(result).context("Failed to serialise result")?
        );
    } else {
        io::stdout()
            .lock()
            .write_all(result.content.as_bytes())
            .context("Failed to write to stdout")?;
    }
    Ok(())
}

fn report_failure(cli: &Cli, failure: &ConvertFailure) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&failure.payload())?);
        std::process::exit(1);
    }
    Err(anyhow::anyhow!("{failure}")).context(format!("Conversion failed (run {})", failure.run_id))
}

/// `report.docx` → `report.md`; `notes.md` → `notes.md`.
fn output_name(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "output".into());
    PathBuf::from(stem).with_extension("md")
}

async fn write_markdown(target: &Path, content: &str) -> Result<()> {
    let tmp = target.with_extension("md.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, target)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(())
}
