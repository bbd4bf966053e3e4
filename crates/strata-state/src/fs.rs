use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::schema::{decode_state_file, encode_state_file, normalize_key, BuildStateFile};
use crate::store::{Candidates, StateStore};

/// Filesystem-backed state store with one directory per bucket tag.
///
/// Layout: `<root>/<sanitized tag>-<tag hash>/<bucket id>.json`
///
/// The directory name is derived from the normalized tag only, so a lookup
/// reads a single directory regardless of how many modules the store holds.
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    /// Create a new `FsStateStore` rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> StateResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StateError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tag_dir(&self, tag: &str) -> PathBuf {
        let normalized = normalize_key(tag);
        let sanitized: String = normalized
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
                '/' => '~',
                _ => '_',
            })
            .collect();
        let tag_hash = hex::encode(Sha256::digest(normalized.as_bytes()));
        self.root.join(format!("{}-{}", sanitized, &tag_hash[..8]))
    }

    fn file_path(&self, tag: &str, id: &str) -> PathBuf {
        self.tag_dir(tag).join(format!("{id}.json"))
    }

    fn read_dir_files(dir: &Path) -> StateResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(dir.display().to_string(), e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(dir.display().to_string(), e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_file(path: &Path) -> StateResult<BuildStateFile> {
        let location = path.display().to_string();
        let bytes = fs::read(path).map_err(|e| StateError::io(location.clone(), e))?;
        decode_state_file(&bytes, &location)
    }
}

impl StateStore for FsStateStore {
    fn candidates(&self, tag: &str) -> StateResult<Candidates> {
        let wanted = normalize_key(tag);
        let files = Self::read_dir_files(&self.tag_dir(tag))?;
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            match Self::read_file(&path) {
                Ok(file) if file.bucket.normalized_tag() == wanted => out.push(Ok(file)),
                Ok(file) => {
                    warn!(
                        location = %path.display(),
                        stored_tag = %file.bucket.tag,
                        "state file stored under a foreign tag directory, ignoring"
                    );
                }
                Err(e) => out.push(Err(e)),
            }
        }
        Ok(out)
    }

    fn write(&self, file: &BuildStateFile) -> StateResult<String> {
        let id = file.persisted_id()?;
        let path = self.file_path(&file.bucket.tag, id);
        let location = path.display().to_string();

        if path.exists() {
            debug!(location = %location, "state file already present, keeping existing record");
            return Ok(location);
        }

        let bytes = encode_state_file(file)?;
        let dir = self.tag_dir(&file.bucket.tag);
        fs::create_dir_all(&dir).map_err(|e| StateError::io(dir.display().to_string(), e))?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp =
            NamedTempFile::new_in(&dir).map_err(|e| StateError::io(location.clone(), e))?;
        tmp.write_all(&bytes)
            .map_err(|e| StateError::io(location.clone(), e))?;
        tmp.persist(&path)
            .map_err(|e| StateError::io(location.clone(), e.error))?;

        Ok(location)
    }

    fn list_tags(&self) -> StateResult<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| StateError::io(self.root.display().to_string(), e))?;
        let mut tags = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(self.root.display().to_string(), e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let first_valid = Self::read_dir_files(&entry.path())?
                .into_iter()
                .find_map(|p| Self::read_file(&p).ok());
            if let Some(file) = first_valid {
                tags.push(file.bucket.tag);
            }
        }
        tags.sort();
        Ok(tags)
    }

    fn remove_tag(&self, tag: &str) -> StateResult<usize> {
        let dir = self.tag_dir(tag);
        let count = Self::read_dir_files(&dir)?.len();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StateError::io(dir.display().to_string(), e))?;
        }
        Ok(count)
    }
}
