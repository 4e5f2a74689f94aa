//! Coordination directory layout and the small file primitives every
//! component builds on.
//!
//! ```text
//! <root>/
//!   tasks.json          task store (whole-document replace)
//!   tasks.json.lock     advisory lock for tasks.json
//!   status.jsonl        shared status log (exclusive append)
//!   locks/<id>.json     one lease per resource (atomic create)
//!   locks/<id>.guard    short-lived guard lock, removed on release
//!   mailbox/<w>.jsonl   per-worker instruction stream (locked append)
//!   offsets/<w>.json    per-worker read offset (temp + rename)
//!   results/<id>.md     task output
//!   stop                shutdown sentinel written by `hive down`
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::ExitError;

/// Paths inside one coordination directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory the protocol writes into.
    ///
    /// This is the one place where I/O failure is fatal: a process that cannot
    /// create its coordination directory must not start.
    pub fn ensure(&self) -> Result<(), ExitError> {
        for dir in [
            self.root.clone(),
            self.locks_dir(),
            self.mailbox_dir(),
            self.offsets_dir(),
            self.results_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| ExitError::Setup {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn tasks_lock_file(&self) -> PathBuf {
        self.root.join("tasks.json.lock")
    }

    pub fn status_log(&self) -> PathBuf {
        self.root.join("status.jsonl")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lease_file(&self, resource_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.json", file_stem(resource_id)))
    }

    pub fn lease_guard_file(&self, resource_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.guard", file_stem(resource_id)))
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.root.join("mailbox")
    }

    pub fn mailbox_file(&self, worker_id: &str) -> PathBuf {
        self.mailbox_dir().join(format!("{}.jsonl", file_stem(worker_id)))
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.root.join("offsets")
    }

    pub fn offset_file(&self, worker_id: &str) -> PathBuf {
        self.offsets_dir().join(format!("{}.json", file_stem(worker_id)))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn result_file(&self, task_id: &str) -> PathBuf {
        self.results_dir().join(format!("{}.md", file_stem(task_id)))
    }

    pub fn stop_file(&self) -> PathBuf {
        self.root.join("stop")
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_file().exists()
    }
}

/// Map an id to a file name stem.
///
/// Ids made only of `[A-Za-z0-9._-]` are used as-is. Anything else is
/// sanitized and suffixed with a short hash of the original id, so two
/// different ids never share a file.
pub fn file_stem(id: &str) -> String {
    let safe = !id.is_empty()
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if safe {
        return id.to_string();
    }

    let sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    let digest = Sha256::digest(id.as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{sanitized}-{hash}")
}

/// Unique sibling path for a temp file next to `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let suffix: u64 = rand::rng().random();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}-{suffix:016x}", std::process::id()))
}

/// Replace `path` with `body` so readers see either the old or the new
/// content, never a mix.
pub fn atomic_write(path: &Path, body: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Append one line with a single write, holding an exclusive advisory lock
/// for the duration of the write, then flush it to disk.
pub fn locked_append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    let result = file.write_all(buf.as_bytes()).and_then(|()| file.sync_data());
    let _ = FileExt::unlock(&file);
    result
}

/// Split file content into complete (newline-terminated) lines.
///
/// A trailing fragment without a newline belongs to an append still in
/// flight and is left for the next read.
pub fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .split_inclusive('\n')
        .filter(|l| l.ends_with('\n'))
        .map(|l| l.trim_end_matches(['\n', '\r']))
}
