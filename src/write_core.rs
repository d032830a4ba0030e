//! Atomic replacement of small state files (hook session, bootstrap report):
//! write to a sibling temp file, fsync, rename over the target, fsync the dir.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    Durable,
    Fast,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub durability: DurabilityMode,
    /// Skip the rename entirely when the target already holds these bytes.
    pub idempotent_skip: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Durable,
            idempotent_skip: true,
        }
    }
}

impl WriteOptions {
    pub fn fast() -> Self {
        Self {
            durability: DurabilityMode::Fast,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteStats {
    pub bytes_written: u64,
    pub fsync_count: u32,
    pub elapsed: Duration,
    pub skipped_unchanged: bool,
}

pub struct AtomicWriter {
    options: WriteOptions,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new(WriteOptions::default())
    }
}

impl AtomicWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    /// Pretty JSON followed by a newline.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<WriteStats> {
        let mut body = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialise {}", path.display()))?;
        body.push(b'\n');
        self.write_bytes(path, &body)
    }

    pub fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<WriteStats> {
        let start = Instant::now();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        if self.options.idempotent_skip && same_content(path, content)? {
            return Ok(WriteStats {
                bytes_written: 0,
                fsync_count: 0,
                elapsed: start.elapsed(),
                skipped_unchanged: true,
            });
        }

        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;

        let mut temp = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            writer
                .write_all(content)
                .with_context(|| format!("Failed to write {} bytes to temp file", content.len()))?;
            writer.flush().context("Failed to flush temp file")?;
        }

        let mut fsync_count = 0u32;
        let durable = self.options.durability == DurabilityMode::Durable;
        if durable {
            temp.as_file()
                .sync_data()
                .with_context(|| format!("Failed to sync temp data for {}", path.display()))?;
            fsync_count += 1;
        }

        temp.persist(path).map_err(|e| {
            anyhow::Error::new(e.error)
                .context(format!("Failed to atomically replace {}", path.display()))
        })?;

        if durable {
            fsync_dir(parent)?;
            fsync_count += 1;
        }

        Ok(WriteStats {
            bytes_written: content.len() as u64,
            fsync_count,
            elapsed: start.elapsed(),
            skipped_unchanged: false,
        })
    }
}

fn same_content(path: &Path, content: &[u8]) -> Result<bool> {
    match fs::read(path) {
        Ok(existing) => Ok(existing == content),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to fsync directory {}", dir.display()))
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Remove a state file; a missing file is not an error.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_then_skips_identical_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let writer = AtomicWriter::default();

        let first = writer.write_bytes(&path, b"{}").unwrap();
        assert!(!first.skipped_unchanged);
        assert_eq!(first.fsync_count, 2);

        let second = writer.write_bytes(&path, b"{}").unwrap();
        assert!(second.skipped_unchanged);
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn creates_missing_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("nested").join("report.json");
        AtomicWriter::new(WriteOptions::fast())
            .write_json(&path, &serde_json::json!({"ok": true}))
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"ok\": true"));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.json");
        let writer = AtomicWriter::default();
        writer.write_bytes(&path, b"one").unwrap();
        writer.write_bytes(&path, b"two").unwrap();
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn remove_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        assert!(!remove_if_exists(&tmp.path().join("nope")).unwrap());
    }
}
