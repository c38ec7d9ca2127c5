pub mod agent_core;
pub mod config;
pub mod inference;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub use agent_core::{Agent, AgentError, AgentEvent, AgentStatus, Template, TemplateFormat};
pub use config::{AppConfig, LoggingSettings};
pub use inference::{CompletionBackend, InferenceError, LlamaClient};

const LOG_FILE_NAME: &str = "agent.log";
const DEFAULT_LOG_FILTER: &str = "llama_agent=info,warn";

/// Return the platform-standard data directory for llama-agent.
///
/// - macOS: `~/Library/Application Support/llama-agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\llama-agent\`
/// - Linux: `$XDG_DATA_HOME/llama-agent/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.llama-agent/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("llama-agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llama-agent")
}

/// Initialize the tracing subscriber, writing to `agent.log` in the data
/// directory. Returns the log file path.
///
/// Previous logs are rotated first (`settings.keep_files` generations are
/// kept). `RUST_LOG` overrides the default filter, and `settings.json` or
/// `LLAMA_AGENT_LOG_JSON=1` selects one JSON object per line.
pub fn init_tracing(settings: &LoggingSettings) -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, settings.keep_files);
    let writer = FlushingWriter::open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = settings.json || std::env::var("LLAMA_AGENT_LOG_JSON").is_ok_and(|v| v == "1");
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        keep_files = settings.keep_files,
        pid = std::process::id(),
        "=== llama-agent starting ==="
    );

    Ok(log_path)
}

/// `agent.log` → `agent.log.<n>`.
fn generation_path(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `base` into numbered generations, dropping anything past `keep`.
/// With `keep == 0` the previous log is simply discarded.
fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(base);
        return;
    }

    let _ = fs::remove_file(generation_path(base, keep));
    for n in (1..keep).rev() {
        let _ = fs::rename(generation_path(base, n), generation_path(base, n + 1));
    }
    if base.exists() {
        let _ = fs::rename(base, generation_path(base, 1));
    }
}

/// Appends to the log file and flushes after every write, so each line is
/// on disk even if the process is killed mid-generation.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        // A panic mid-write leaves at worst a torn line.
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut file)
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            let n = file.write(buf)?;
            file.flush()?;
            Ok(n)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        fs::write(&base, "current").unwrap();
        fs::write(generation_path(&base, 1), "one").unwrap();
        fs::write(generation_path(&base, 2), "two").unwrap();
        fs::write(generation_path(&base, 3), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(read(&dir.path().join("agent.log.1")), "current");
        assert_eq!(read(&dir.path().join("agent.log.2")), "one");
        assert_eq!(read(&dir.path().join("agent.log.3")), "two");
    }

    #[test]
    fn test_rotate_honours_keep_count() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        fs::write(&base, "current").unwrap();
        fs::write(generation_path(&base, 1), "one").unwrap();

        rotate_log_file(&base, 1);

        assert_eq!(read(&generation_path(&base, 1)), "current");
        assert!(!generation_path(&base, 2).exists());
    }

    #[test]
    fn test_rotate_keep_zero_discards_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 0);

        assert!(!base.exists());
        assert!(!generation_path(&base, 1).exists());
    }

    #[test]
    fn test_rotate_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);

        assert_eq!(read(&generation_path(&base, 1)), "current");
        assert!(!generation_path(&base, 2).exists());
    }

    #[test]
    fn test_flushing_writer_appends_through_clones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        fs::write(&path, "earlier\n").unwrap();

        let mut writer = FlushingWriter::open(&path).unwrap();
        writer.write_all(b"line one\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"line two\n").unwrap();

        assert_eq!(read(&path), "earlier\nline one\nline two\n");
    }
}
