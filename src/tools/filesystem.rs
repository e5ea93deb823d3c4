//! Workspace-confined directory listing and file reading

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::{error_envelope, success_envelope};

/// Characters of text returned per file
pub const PREVIEW_CHARS: usize = 5000;

/// Bytes read per file; enough for `PREVIEW_CHARS` of any UTF-8 text
const PREVIEW_BYTES: usize = PREVIEW_CHARS * 4;

/// Bytes inspected for NULs when deciding whether a file is binary
const SNIFF_BYTES: usize = 8192;

/// Root directory the filesystem tools may touch
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` inside the workspace, rejecting anything that escapes
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.root) {
            return Err(format!("access denied: '{path}' is outside the workspace"));
        }

        // Symlinks may still point outside
        if let Ok(canonical) = normalized.canonicalize() {
            if !canonical.starts_with(&self.root) {
                return Err(format!("access denied: '{path}' is outside the workspace"));
            }
            return Ok(canonical);
        }
        Ok(normalized)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// List a directory: directories first, then case-insensitive by name
    pub async fn read_directory(&self, path: Option<&str>) -> Value {
        let dir = match path {
            Some(p) => match self.resolve(p) {
                Ok(dir) => dir,
                Err(e) => return error_envelope(e),
            },
            None => self.root.clone(),
        };
        if !fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return error_envelope(format!("not a directory: {}", path.unwrap_or(".")));
        }

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => return error_envelope(format!("cannot read directory: {e}")),
        };

        let mut items: Vec<(bool, String, Value)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = metadata.is_dir();
            let item = json!({
                "name": name,
                "path": self.relative(&entry.path()),
                "kind": if is_dir { "directory" } else { "file" },
                "size": if is_dir { 0 } else { metadata.len() },
                "modified": metadata.modified().ok().map(format_time),
            });
            items.push((is_dir, name.to_lowercase(), item));
        }
        items.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        success_envelope(json!({
            "path": self.relative(&dir),
            "items": items.into_iter().map(|(_, _, item)| item).collect::<Vec<_>>(),
        }))
    }

    /// Read one file: text preview or a binary marker
    ///
    /// Only the first `PREVIEW_CHARS * 4` bytes are read.
    pub async fn read_file(&self, filename: &str) -> Value {
        let error = |message: String| {
            json!({ "status": "error", "filename": filename, "message": message })
        };

        let path = match self.resolve(filename) {
            Ok(path) => path,
            Err(e) => return error(e),
        };
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return error(format!("file not found: {filename}")),
        };
        if metadata.is_dir() {
            return error(format!("is a directory: {filename}"));
        }
        let prefix = match read_prefix(&path, PREVIEW_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => return error(format!("cannot read {filename}: {e}")),
        };

        let size = metadata.len();
        let modified = metadata.modified().ok().map(format_time);
        let at_eof = prefix.len() as u64 >= size;

        match preview(&prefix, at_eof) {
            Some((content, consumed)) => json!({
                "status": "success",
                "filename": filename,
                "size": size,
                "modified": modified,
                "is_binary": false,
                "content": content,
                "truncated": (consumed as u64) < size,
            }),
            None => json!({
                "status": "success",
                "filename": filename,
                "size": size,
                "modified": modified,
                "is_binary": true,
                "content": null,
                "truncated": false,
            }),
        }
    }

    /// Read every file, in order; one failure never stops the rest
    pub async fn read_files(&self, filenames: &[String]) -> Value {
        let mut results = Vec::with_capacity(filenames.len());
        for filename in filenames {
            results.push(self.read_file(filename).await);
        }
        Value::Array(results)
    }
}

async fn read_prefix(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = fs::File::open(path).await?;
    let mut bytes = Vec::with_capacity(limit.min(64 * 1024));
    file.take(limit as u64).read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Up to `PREVIEW_CHARS` characters of `prefix` and the bytes they span
///
/// `None` means binary: a NUL in the sniffed region, or invalid UTF-8 before
/// the preview is full. A multi-byte sequence cut off by the read limit is
/// not an error unless the file really ends there.
fn preview(prefix: &[u8], at_eof: bool) -> Option<(String, usize)> {
    if prefix[..prefix.len().min(SNIFF_BYTES)].contains(&0) {
        return None;
    }
    let (valid, invalid_tail) = match std::str::from_utf8(prefix) {
        Ok(text) => (text, false),
        Err(e) => {
            let cut_short = e.error_len().is_none() && !at_eof;
            let valid = std::str::from_utf8(&prefix[..e.valid_up_to()]).ok()?;
            (valid, !cut_short)
        }
    };

    let (consumed, count) = valid
        .char_indices()
        .take(PREVIEW_CHARS)
        .fold((0, 0), |(_, n), (i, c)| (i + c.len_utf8(), n + 1));
    if invalid_tail && count < PREVIEW_CHARS {
        return None;
    }
    Some((valid[..consumed].to_string(), consumed))
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}
