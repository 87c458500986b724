//! File-backed state store with exclusive cross-process locking.

use crate::error::{Error, Result};
use crate::state::State;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);

/// Manages reading and writing state to a JSON file, with a sibling lock
/// file for advisory exclusive locking. Every compound read-modify-write
/// must go through [`FileStore::with_lock`]; the OS releases the lock on
/// process exit, so a crash never wedges other invocations.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    file_path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir` (typically `<repo>/.portree`),
    /// creating the directory with mode 0700 if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        Ok(Self {
            file_path: dir.join("state.json"),
            lock_path: dir.join("state.lock"),
            dir,
        })
    }

    /// Read the state from disk. An absent file yields an empty state; a
    /// corrupt file logs a warning and yields an empty state so that an
    /// untrusted document can never wedge the tool.
    pub fn load(&self) -> Result<State> {
        let data = match fs::read(&self.file_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(State::default()),
            Err(e) => return Err(Error::State(format!("reading state: {e}"))),
        };

        match serde_json::from_slice(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!("corrupt state file, starting fresh: {e}");
                Ok(State::default())
            }
        }
    }

    /// Serialize the state as pretty-printed JSON and atomically replace the
    /// file (write to a temp sibling, then rename). File mode 0600.
    pub fn save(&self, state: &State) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::State(format!("serializing state: {e}")))?;

        let tmp_path = self.file_path.with_extension("json.tmp");
        {
            let mut f = open_private(&tmp_path, true)?;
            f.write_all(&data)
                .map_err(|e| Error::State(format!("writing state: {e}")))?;
        }
        fs::rename(&tmp_path, &self.file_path)
            .map_err(|e| Error::State(format!("replacing state file: {e}")))?;
        Ok(())
    }

    /// Run `f` while holding an exclusive advisory lock on the lock file.
    /// Acquisition polls every 50 ms until a 10-second deadline. The lock is
    /// released on every exit path (explicitly, and by the OS when the file
    /// handle drops).
    pub async fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let lock_file = open_private(&self.lock_path, false)?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(LOCK_TIMEOUT));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(Error::State(format!("acquiring lock: {e}"))),
            }
        }

        let result = f();
        if let Err(e) = FileExt::unlock(&lock_file) {
            tracing::warn!("releasing state lock: {e}");
        }
        result
    }

    /// The state directory, exposed for log placement.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| Error::State(format!("creating state directory: {e}")))?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir).map_err(|e| Error::State(format!("creating state directory: {e}")))?;
    Ok(())
}

fn open_private(path: &Path, truncate: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).read(true);
    if truncate {
        opts.truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
        .map_err(|e| Error::State(format!("opening {}: {e}", path.display())))
}
