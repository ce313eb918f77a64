pub mod conversation;
pub mod inference;
pub mod keys;
pub mod repl;

use std::sync::Arc;

use anyhow::Context;

use conversation::QueryOrchestrator;
use inference::Settings;

/// Return the platform-standard data directory for Gemini Overlay.
///
/// - macOS: `~/Library/Application Support/gemini-overlay/`
/// - Windows: `{FOLDERID_RoamingAppData}\gemini-overlay\`
/// - Linux: `$XDG_DATA_HOME/gemini-overlay/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.gemini-overlay/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("gemini-overlay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".gemini-overlay")
}

/// Initialize the tracing subscriber, writing structured logs to the data directory.
///
/// On each startup:
/// 1. Rotates existing logs (overlay.log → overlay.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh overlay.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
///
/// Logs never go to stdout, which carries the streamed answers.
pub fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("overlay.log");

    // Rotate: overlay.log.2 → .3, .1 → .2, overlay.log → .1
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let flushing_writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gemini_overlay=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(flushing_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Gemini Overlay starting ==="
    );

    Ok(())
}

/// Rotate log files: `overlay.log` → `overlay.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process is killed mid-stream.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Load the credential file. A missing file or one without any `API_KEY_*`
/// entry stops startup.
fn load_key_pool(env_path: &std::path::Path) -> anyhow::Result<keys::KeyPool> {
    let pool = keys::load_env_file(env_path)
        .with_context(|| format!("failed to load API keys from {}", env_path.display()))?;
    tracing::info!(
        path = %env_path.display(),
        keys = ?pool.key_names(),
        "key pool loaded"
    );
    Ok(pool)
}

/// Load settings and credentials, then run the terminal session.
pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing FIRST, before any tracing::info!() calls
    init_tracing()?;

    let settings_path = Settings::default_path();
    let settings = Settings::load_or_default(&settings_path);
    settings.validate().context("invalid settings")?;

    let pool = load_key_pool(&keys::find_env_file())?;

    let orchestrator = QueryOrchestrator::from_settings(&settings, keys::shared(pool))
        .context("failed to build query orchestrator")?;

    repl::run(Arc::new(orchestrator), settings, settings_path).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
