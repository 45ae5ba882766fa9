use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use tracing::warn;

use super::{HistoryStore, ProviderError, check_contiguous};
use crate::Event;

const HISTORY_EXT: &str = "jsonl";

/// Filesystem-backed history store writing one JSONL file per instance.
///
/// Each append is written as a single buffer and synced before it returns,
/// so a restarted process reads back every acknowledged event.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    // serializes version check + write within this process
    write_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    /// If `reset_on_create` is true, existing data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, ProviderError> {
        let path = root.as_ref().to_path_buf();
        if reset_on_create && path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            root: path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.{HISTORY_EXT}", encode_file_stem(instance)))
    }

    async fn read_path(&self, instance: &str, path: &Path) -> Result<Vec<Event>, ProviderError> {
        Ok(self.load(instance, path).await?.events)
    }

    /// Parse every newline-terminated line. A final line without `\n` is the
    /// remains of an append that never returned, so it is left out.
    async fn load(&self, instance: &str, path: &Path) -> Result<Loaded, ProviderError> {
        let data = match fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Loaded {
                    events: Vec::new(),
                    committed_len: 0,
                    file_len: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let committed_len = data.rfind('\n').map_or(0, |i| i + 1);
        if committed_len < data.len() {
            warn!(
                target: "durable_workflow::providers",
                instance_id = %instance,
                torn_bytes = data.len() - committed_len,
                "ignoring unterminated tail of history file"
            );
        }
        let mut events = Vec::new();
        for (lineno, line) in data[..committed_len].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line).map_err(|e| {
                ProviderError::permanent("read_events", format!("{instance}: line {} is not valid JSON: {e}", lineno + 1))
            })?;
            events.push(ev);
        }
        Ok(Loaded {
            events,
            committed_len: committed_len as u64,
            file_len: data.len() as u64,
        })
    }
}

struct Loaded {
    events: Vec<Event>,
    committed_len: u64,
    file_len: u64,
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.read_path(instance, &self.history_path(instance)).await
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let _guard = self.write_lock.lock().await;
        let path = self.history_path(instance);
        let loaded = self.load(instance, &path).await?;
        let actual = loaded.events.len() as u64;
        if actual != expected_version {
            return Err(ProviderError::version_conflict(instance, expected_version, actual));
        }
        check_contiguous(instance, expected_version, &events)?;
        if events.is_empty() {
            return Ok(actual);
        }

        let mut buf = String::new();
        for ev in &events {
            let line = serde_json::to_string(ev)
                .map_err(|e| ProviderError::permanent("append_events", format!("{instance}: {e}")))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        if loaded.committed_len < loaded.file_len {
            file.set_len(loaded.committed_len).await?;
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(actual + events.len() as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(HISTORY_EXT) {
                continue;
            }
            if let Some(instance) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_file_stem) {
                out.push(instance);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Instance ids may contain characters that are not safe in file names
/// (child ids use `::`), so anything outside `[A-Za-z0-9._-]` is `%XX`-escaped.
fn encode_file_stem(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
