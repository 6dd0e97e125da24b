//! GPU capability probe with a TTL- and environment-keyed cache.
//!
//! Detection layers, first positive wins:
//!
//! 1. `CUDA_VISIBLE_DEVICES` set to `""`, `-1`, `none` or `void` forces
//!    "unavailable" before anything else runs.
//! 2. `nvidia-smi` (PATH, then the usual Windows install locations) with
//!    `--query-gpu=index --format=csv,noheader` and `-L`, each bounded by a
//!    3 s timeout. Exit 0 with non-empty stdout counts as a GPU.
//! 3. `CUDA_PATH` / `CUDA_HOME` pointing at an existing directory.
//!
//! The result is memoised together with the `(CUDA_VISIBLE_DEVICES,
//! CUDA_PATH, CUDA_HOME)` tuple it was computed from. A snapshot is reused
//! while it is younger than the TTL and the tuple is unchanged. Refreshes go
//! through check-lock-recheck so concurrent first callers run the probe once.

use crate::config::{env_parse, EnvSource, ProcessEnv, DEFAULT_PROBE_TTL_SECS, ENV_PROBE_TTL};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The detection routine. Swappable so tests never spawn processes.
pub type GpuDetector = Arc<dyn Fn(&dyn EnvSource) -> bool + Send + Sync>;

/// Environment tuple a snapshot is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeKey {
    cuda_visible_devices: Option<String>,
    cuda_path: Option<String>,
    cuda_home: Option<String>,
}

impl ProbeKey {
    fn read(env: &dyn EnvSource) -> Self {
        Self {
            cuda_visible_devices: env.var("CUDA_VISIBLE_DEVICES"),
            cuda_path: env.var("CUDA_PATH"),
            cuda_home: env.var("CUDA_HOME"),
        }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    available: bool,
    captured_at: Instant,
    key: ProbeKey,
}

impl Snapshot {
    fn is_fresh(&self, key: &ProbeKey, ttl: Duration, now: Instant) -> bool {
        self.key == *key && now.saturating_duration_since(self.captured_at) <= ttl
    }
}

/// Memoising GPU probe. Share one instance per process via `Arc`.
pub struct GpuProbe {
    env: Arc<dyn EnvSource>,
    detector: GpuDetector,
    ttl: Option<Duration>,
    state: RwLock<Option<Snapshot>>,
    refresh: Mutex<()>,
}

impl std::fmt::Debug for GpuProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuProbe")
            .field("ttl", &self.ttl)
            .field("cached", &self.cached())
            .finish()
    }
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GpuProbe {
    /// Probe the real process environment. `ttl = None` reads
    /// `DOC2MD_GPU_PROBE_TTL_SECONDS` on every call.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_parts(Arc::new(ProcessEnv), Arc::new(detect_gpu), ttl)
    }

    /// Inject the environment and the detection routine.
    pub fn with_parts(env: Arc<dyn EnvSource>, detector: GpuDetector, ttl: Option<Duration>) -> Self {
        Self {
            env,
            detector,
            ttl,
            state: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Whether GPU execution is usable. `force_refresh` ignores any cached
    /// snapshot.
    pub fn is_gpu_available(&self, force_refresh: bool) -> bool {
        let key = ProbeKey::read(self.env.as_ref());
        let ttl = self.ttl();

        if !force_refresh {
            if let Some(hit) = self.fresh_snapshot(&key, ttl) {
                return hit;
            }
        }

        let _guard = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if !force_refresh {
            if let Some(hit) = self.fresh_snapshot(&key, ttl) {
                return hit;
            }
        }

        let started = Instant::now();
        let available = (self.detector)(self.env.as_ref());
        debug!(
            available,
            elapsed_ms = started.elapsed().as_millis() as u64,
            force_refresh,
            "GPU capability probe finished"
        );

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(Snapshot {
            available,
            captured_at: Instant::now(),
            key,
        });
        available
    }

    /// Drop the cached snapshot.
    pub fn reset(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Cached value regardless of freshness, if any.
    pub fn cached(&self) -> Option<bool> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.available)
    }

    /// Populate the cache in the background.
    ///
    /// Uses the tokio blocking pool when called inside a runtime, a plain
    /// thread otherwise. Never blocks the caller.
    pub fn warm_up(self: &Arc<Self>) {
        let probe = Arc::clone(self);
        let job = move || {
            let available = probe.is_gpu_available(false);
            info!(available, "GPU probe warm-up complete");
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                if let Err(e) = std::thread::Builder::new()
                    .name("doc2md-gpu-probe".into())
                    .spawn(job)
                {
                    debug!(error = %e, "Could not spawn GPU probe warm-up thread");
                }
            }
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl.unwrap_or_else(|| {
            let secs: i64 = env_parse(
                self.env.as_ref(),
                ENV_PROBE_TTL,
                DEFAULT_PROBE_TTL_SECS as i64,
            );
            Duration::from_secs(secs.max(0) as u64)
        })
    }

    fn fresh_snapshot(&self, key: &ProbeKey, ttl: Duration) -> Option<bool> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .as_ref()
            .filter(|s| s.is_fresh(key, ttl, Instant::now()))
            .map(|s| s.available)
    }
}

// ── Detection layers ─────────────────────────────────────────────────────

/// Default detection routine.
pub fn detect_gpu(env: &dyn EnvSource) -> bool {
    if !cuda_devices_visible(env) {
        return false;
    }
    if nvidia_smi_candidates(env)
        .iter()
        .any(|exe| nvidia_smi_reports_gpu(exe))
    {
        return true;
    }
    cuda_install_exists(env)
}

/// `false` only when `CUDA_VISIBLE_DEVICES` explicitly hides every device.
pub fn cuda_devices_visible(env: &dyn EnvSource) -> bool {
    match env.var("CUDA_VISIBLE_DEVICES") {
        None => true,
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "" | "-1" | "none" | "void"
        ),
    }
}

fn nvidia_smi_candidates(env: &dyn EnvSource) -> Vec<PathBuf> {
    let mut exes = vec![PathBuf::from("nvidia-smi")];
    let system_root = env.var("SystemRoot").unwrap_or_else(|| "C:/Windows".into());
    exes.push(PathBuf::from(system_root).join("System32").join("nvidia-smi.exe"));
    if let Some(pf) = env
        .var("ProgramW6432")
        .or_else(|| env.var("ProgramFiles"))
        .filter(|v| !v.is_empty())
    {
        exes.push(
            PathBuf::from(pf)
                .join("NVIDIA Corporation")
                .join("NVSMI")
                .join("nvidia-smi.exe"),
        );
    }
    exes
}

fn nvidia_smi_reports_gpu(exe: &Path) -> bool {
    const ARG_SETS: [&[&str]; 2] = [&["--query-gpu=index", "--format=csv,noheader"], &["-L"]];
    ARG_SETS
        .iter()
        .any(|args| {
            run_with_timeout(exe, args, NVIDIA_SMI_TIMEOUT).is_some_and(|out| !out.trim().is_empty())
        })
}

/// Stdout of a successful run, `None` on spawn failure, non-zero exit or
/// timeout (the child is killed).
fn run_with_timeout(exe: &Path, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    // Drain stdout while waiting so a full pipe cannot stall the child.
    let reader = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            out.read_to_end(&mut buf).map(|_| buf)
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
            Ok(None) => {
                debug!(exe = %exe.display(), "nvidia-smi timed out");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Err(_) => {
                let _ = child.kill();
                return None;
            }
        }
    };

    let stdout = reader?.join().ok()?.ok()?;
    status
        .success()
        .then(|| String::from_utf8_lossy(&stdout).into_owned())
}

fn cuda_install_exists(env: &dyn EnvSource) -> bool {
    env.var("CUDA_PATH")
        .filter(|v| !v.is_empty())
        .or_else(|| env.var("CUDA_HOME").filter(|v| !v.is_empty()))
        .is_some_and(|p| expand_home(&p).exists())
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Env whose contents can change between calls.
    #[derive(Default)]
    struct MutableEnv(Mutex<HashMap<String, String>>);

    impl MutableEnv {
        fn set(&self, k: &str, v: &str) {
            self.0.lock().unwrap().insert(k.into(), v.into());
        }
    }

    impl EnvSource for MutableEnv {
        fn var(&self, name: &str) -> Option<String> {
            self.0.lock().unwrap().get(name).cloned()
        }
    }

    struct Fake {
        calls: Arc<AtomicUsize>,
        answer: Arc<AtomicBool>,
        env: Arc<MutableEnv>,
    }

    fn fake(ttl: Option<Duration>) -> (GpuProbe, Fake) {
        let calls = Arc::new(AtomicUsize::new(0));
        let answer = Arc::new(AtomicBool::new(true));
        let env = Arc::new(MutableEnv::default());
        let (c, a) = (calls.clone(), answer.clone());
        let detector: GpuDetector = Arc::new(move |_: &dyn EnvSource| {
            c.fetch_add(1, Ordering::SeqCst);
            a.load(Ordering::SeqCst)
        });
        let probe = GpuProbe::with_parts(env.clone(), detector, ttl);
        (probe, Fake { calls, answer, env })
    }

    #[test]
    fn cached_value_survives_environment_drift_inside_ttl() {
        let (probe, f) = fake(Some(Duration::from_secs(60)));
        assert!(probe.is_gpu_available(false));
        f.answer.store(false, Ordering::SeqCst);
        assert!(probe.is_gpu_available(false));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_refresh_recomputes() {
        let (probe, f) = fake(Some(Duration::from_secs(60)));
        assert!(probe.is_gpu_available(false));
        f.answer.store(false, Ordering::SeqCst);
        assert!(!probe.is_gpu_available(true));
        assert!(!probe.is_gpu_available(false));
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ttl_expiry_recomputes() {
        let (probe, f) = fake(Some(Duration::from_millis(20)));
        assert!(probe.is_gpu_available(false));
        f.answer.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert!(!probe.is_gpu_available(false));
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn env_key_change_invalidates_immediately() {
        let (probe, f) = fake(Some(Duration::from_secs(3600)));
        probe.is_gpu_available(false);
        f.env.set("CUDA_PATH", "/opt/cuda");
        probe.is_gpu_available(false);
        probe.is_gpu_available(false);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ttl_read_from_env_when_unset() {
        let (probe, f) = fake(None);
        f.env.set(ENV_PROBE_TTL, "-5");
        probe.is_gpu_available(false);
        std::thread::sleep(Duration::from_millis(5));
        probe.is_gpu_available(false);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2, "negative TTL clamps to zero");

        let (probe, f) = fake(None);
        f.env.set(ENV_PROBE_TTL, "not-a-number");
        probe.is_gpu_available(false);
        probe.is_gpu_available(false);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1, "invalid TTL falls back to 300 s");
    }

    #[test]
    fn concurrent_first_access_probes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let detector: GpuDetector = Arc::new(move |_: &dyn EnvSource| {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            false
        });
        let probe = Arc::new(GpuProbe::with_parts(
            Arc::new(HashMap::<String, String>::new()),
            detector,
            Some(Duration::from_secs(60)),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = probe.clone();
                std::thread::spawn(move || p.is_gpu_available(false))
            })
            .collect();
        for h in handles {
            assert!(!h.join().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_cache() {
        let (probe, f) = fake(Some(Duration::from_secs(60)));
        probe.is_gpu_available(false);
        assert_eq!(probe.cached(), Some(true));
        probe.reset();
        assert_eq!(probe.cached(), None);
        probe.is_gpu_available(false);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_up_populates_cache() {
        let (probe, _f) = fake(Some(Duration::from_secs(60)));
        let probe = Arc::new(probe);
        probe.warm_up();
        for _ in 0..100 {
            if probe.cached().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(probe.cached(), Some(true));
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_stall_the_child() {
        // Well past a 64 KiB pipe buffer.
        let out = run_with_timeout(
            Path::new("/bin/sh"),
            &["-c", "head -c 300000 /dev/zero | tr '\\0' x"],
            Duration::from_secs(20),
        )
        .expect("command finished");
        assert_eq!(out.len(), 300_000);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_and_timeout_yield_none() {
        assert!(run_with_timeout(Path::new("/bin/sh"), &["-c", "echo gpu; exit 3"], Duration::from_secs(5)).is_none());
        assert!(run_with_timeout(Path::new("/bin/sh"), &["-c", "sleep 5"], Duration::from_millis(100)).is_none());
    }

    #[test]
    fn visibility_override_blocks_detection() {
        let env: HashMap<String, String> =
            [("CUDA_VISIBLE_DEVICES".to_string(), " None ".to_string())].into();
        assert!(!cuda_devices_visible(&env));
        assert!(!detect_gpu(&env));

        let env: HashMap<String, String> =
            [("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string())].into();
        assert!(cuda_devices_visible(&env));
        assert!(cuda_devices_visible(&HashMap::<String, String>::new()));
    }

    #[test]
    fn install_path_hint() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<String, String> =
            [("CUDA_HOME".to_string(), dir.path().display().to_string())].into();
        assert!(cuda_install_exists(&env));
        let env: HashMap<String, String> =
            [("CUDA_PATH".to_string(), "/definitely/not/here".to_string())].into();
        assert!(!cuda_install_exists(&env));
    }

    #[test]
    fn windows_candidates_follow_env() {
        let env: HashMap<String, String> = [
            ("SystemRoot".to_string(), "D:/Win".to_string()),
            ("ProgramFiles".to_string(), "E:/Apps".to_string()),
        ]
        .into();
        let c = nvidia_smi_candidates(&env);
        assert_eq!(c.len(), 3);
        assert!(c[1].starts_with("D:/Win"));
        assert!(c[2].ends_with("nvidia-smi.exe"));
    }
}
