/// Directory list management
///
/// Keeps the persisted enable/disable list of backup targets in step with
/// the stacks found under the managed root. Entries registered by absolute
/// path live outside the root and are never touched by reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Local;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::core::error::DirListError;
use crate::core::lock::FileLock;
use crate::utils::constants::{DIRLIST_LOCK_TIMEOUT, MANIFEST_FILES};

/// One backup target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Relative name for discovered stacks, absolute path for external ones
    pub identifier: String,
    pub enabled: bool,
    pub is_external: bool,
}

impl DirectoryEntry {
    /// Snapshot tag used for this entry
    pub fn tag(&self) -> String {
        if self.is_external {
            self.identifier.trim_start_matches('/').replace('/', "_")
        } else {
            self.identifier.clone()
        }
    }
}

/// Changes made by `sync`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct DirListManager {
    base_dir: PathBuf,
    list_file: PathBuf,
    entries: BTreeMap<String, DirectoryEntry>,
    lock_timeout: Duration,
}

impl DirListManager {
    pub fn new(base_dir: impl Into<PathBuf>, list_file: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            list_file: list_file.into(),
            entries: BTreeMap::new(),
            lock_timeout: DIRLIST_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn list_file(&self) -> &Path {
        &self.list_file
    }

    fn lock_path(&self) -> PathBuf {
        self.list_file.with_extension("lock")
    }

    /// Parse the list file. A missing file yields an empty list; malformed
    /// lines are skipped.
    pub fn load(&mut self) -> Result<(), DirListError> {
        self.entries.clear();

        let content = match fs::read_to_string(&self.list_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.list_file.display(), "No directory list yet");
                return Ok(());
            }
            Err(source) => {
                return Err(DirListError::Io {
                    path: self.list_file.clone(),
                    source,
                })
            }
        };

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_line(line) {
                Some(entry) => {
                    self.entries.insert(entry.identifier.clone(), entry);
                }
                None => {
                    debug!(line = lineno + 1, content = line, "Skipping invalid directory list line");
                }
            }
        }

        debug!(
            entries = self.entries.len(),
            path = %self.list_file.display(),
            "Loaded directory list"
        );
        Ok(())
    }

    /// Reconcile discovered entries against the filesystem
    pub fn sync(&mut self) -> Result<SyncReport, DirListError> {
        let discovered: BTreeSet<String> =
            discover_directories(&self.base_dir)?.into_iter().collect();

        let mut report = SyncReport::default();

        for name in &discovered {
            if !self.entries.contains_key(name) {
                report.added.push(name.clone());
            }
        }

        for entry in self.entries.values() {
            if !entry.is_external && !discovered.contains(&entry.identifier) {
                report.removed.push(entry.identifier.clone());
            }
        }

        for name in &report.added {
            self.entries.insert(
                name.clone(),
                DirectoryEntry {
                    identifier: name.clone(),
                    enabled: false,
                    is_external: false,
                },
            );
            info!(dir = %name, "New stack discovered (disabled by default)");
        }

        for name in &report.removed {
            self.entries.remove(name);
            info!(dir = %name, "Stack no longer present, removed from list");
        }

        Ok(report)
    }

    /// Atomically persist the list under the file lock
    pub fn save(&self) -> Result<(), DirListError> {
        let mut lock = FileLock::acquire(self.lock_path(), self.lock_timeout)?;

        let temp = self.write_temp()?;
        self.commit(temp)?;

        lock.release();
        debug!(path = %self.list_file.display(), "Directory list saved");
        Ok(())
    }

    /// [`DirListManager::save`] for async callers: waits for the lock without
    /// blocking the runtime
    pub async fn save_async(&self) -> Result<(), DirListError> {
        let mut lock = FileLock::acquire_async(self.lock_path(), self.lock_timeout).await?;

        let temp = self.write_temp()?;
        self.commit(temp)?;

        lock.release();
        debug!(path = %self.list_file.display(), "Directory list saved");
        Ok(())
    }

    /// Write the rendered list next to the target, without replacing it
    pub(crate) fn write_temp(&self) -> Result<NamedTempFile, DirListError> {
        let dir = self
            .list_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| DirListError::Io {
            path: self.list_file.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;

        let mut temp = tempfile::Builder::new()
            .prefix(".dirlist-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(io_err)?;

        temp.write_all(self.render().as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        Ok(temp)
    }

    fn commit(&self, temp: NamedTempFile) -> Result<(), DirListError> {
        temp.persist(&self.list_file).map_err(|e| DirListError::Io {
            path: self.list_file.clone(),
            source: e.error,
        })?;
        restrict_permissions(&self.list_file).map_err(|source| DirListError::Io {
            path: self.list_file.clone(),
            source,
        })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Docker stack backup directory list\n");
        out.push_str(&format!(
            "# Generated {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str("# Format: <directory>=<true|false>\n");
        out.push_str("# Only enabled directories are backed up.\n\n");

        out.push_str(&format!(
            "# Discovered stacks under {}\n",
            self.base_dir.display()
        ));
        for entry in self.entries.values().filter(|e| !e.is_external) {
            out.push_str(&format!("{}={}\n", entry.identifier, entry.enabled));
        }

        let external: Vec<&DirectoryEntry> =
            self.entries.values().filter(|e| e.is_external).collect();
        if !external.is_empty() {
            out.push_str("\n# External stacks (absolute paths)\n");
            for entry in external {
                out.push_str(&format!("{}={}\n", entry.identifier, entry.enabled));
            }
        }

        out
    }

    pub fn set_enabled(&mut self, identifier: &str, enabled: bool) -> Result<(), DirListError> {
        let entry = self
            .entries
            .get_mut(identifier)
            .ok_or_else(|| DirListError::UnknownEntry(identifier.to_string()))?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Register a stack outside the managed root
    pub fn add_external(&mut self, path: &Path, enabled: bool) -> Result<(), DirListError> {
        validate_absolute_path(path)?;
        let identifier = external_identifier(&path.to_string_lossy()).ok_or_else(|| {
            DirListError::InvalidPath {
                path: path.to_path_buf(),
                reason: "path has no final directory component",
            }
        })?;
        self.entries.insert(
            identifier.clone(),
            DirectoryEntry {
                identifier,
                enabled,
                is_external: true,
            },
        );
        Ok(())
    }

    pub fn remove_external(&mut self, identifier: &str) -> Result<(), DirListError> {
        match self.entries.get(identifier) {
            None => Err(DirListError::UnknownEntry(identifier.to_string())),
            Some(entry) if !entry.is_external => {
                Err(DirListError::NotExternal(identifier.to_string()))
            }
            Some(_) => {
                self.entries.remove(identifier);
                Ok(())
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&DirectoryEntry> {
        self.entries.get(identifier)
    }

    /// All entries in sorted identifier order
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    pub fn enabled(&self) -> Vec<&DirectoryEntry> {
        self.entries.values().filter(|e| e.enabled).collect()
    }

    pub fn disabled(&self) -> Vec<&DirectoryEntry> {
        self.entries.values().filter(|e| !e.enabled).collect()
    }

    pub fn full_path(&self, entry: &DirectoryEntry) -> PathBuf {
        if entry.is_external {
            PathBuf::from(&entry.identifier)
        } else {
            self.base_dir.join(&entry.identifier)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.values().filter(|e| e.enabled).count()
    }

    pub fn disabled_count(&self) -> usize {
        self.len() - self.enabled_count()
    }
}

fn parse_line(line: &str) -> Option<DirectoryEntry> {
    let (identifier, value) = line.split_once('=')?;
    let identifier = identifier.trim();
    let enabled = match value.trim() {
        "true" => true,
        "false" => false,
        _ => return None,
    };

    if identifier.starts_with('/') {
        // Existence is checked at registration time only, so an unmounted
        // path is kept rather than silently dropped
        Some(DirectoryEntry {
            identifier: external_identifier(identifier)?,
            enabled,
            is_external: true,
        })
    } else {
        validate_dir_name(identifier).ok()?;
        Some(DirectoryEntry {
            identifier: identifier.to_string(),
            enabled,
            is_external: false,
        })
    }
}

/// Normalized identifier for an absolute path, `None` for `/` and friends
fn external_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches('/');
    Path::new(trimmed).file_name()?;
    Some(trimmed.to_string())
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static pattern is valid"))
}

pub fn validate_dir_name(name: &str) -> Result<(), DirListError> {
    let invalid = |reason| DirListError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if !name_pattern().is_match(name) {
        return Err(invalid("only letters, digits, '.', '_' and '-' are allowed"));
    }
    if name.starts_with('.') {
        return Err(invalid("hidden directories are not allowed"));
    }
    if name.chars().all(|c| c == '.') {
        return Err(invalid("name cannot consist only of dots"));
    }
    Ok(())
}

pub fn validate_absolute_path(path: &Path) -> Result<(), DirListError> {
    let invalid = |reason| DirListError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if !path.is_dir() {
        return Err(invalid("directory does not exist"));
    }
    if find_manifest(path).is_none() {
        return Err(invalid("no compose file found"));
    }
    Ok(())
}

/// First recognized compose manifest inside `dir`
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Non-hidden subdirectories of `base_dir` holding a compose manifest, sorted
pub fn discover_directories(base_dir: &Path) -> Result<Vec<String>, DirListError> {
    let read = fs::read_dir(base_dir).map_err(|source| DirListError::Io {
        path: base_dir.to_path_buf(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in read.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_dir_name(&name).is_err() {
            continue;
        }
        if find_manifest(&path).is_some() {
            found.push(name);
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
