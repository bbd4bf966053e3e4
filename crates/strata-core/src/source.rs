//! Source-control collaborators used by the fingerprinter.
//!
//! [`GitSourceControl`] drives the `git` binary; [`FsSourceControl`] hashes
//! directory contents directly and serves trees that are not under git.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::LayoutConfig;
use crate::error::{Result, StrataError};

/// Kind of a file-level delta between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

/// One file-level change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceChange {
    pub full_path: String,
    pub change_type: ChangeType,
}

impl SourceChange {
    pub fn new(full_path: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            full_path: full_path.into(),
            change_type,
        }
    }
}

/// Source-control operations the planner depends on.
pub trait SourceControl: Send + Sync {
    /// Commit the build is based on.
    fn head_commit(&self) -> Result<String>;

    /// Uncommitted changes in the working tree.
    fn pending_changes(&self) -> Result<Vec<SourceChange>>;

    /// Committed changes between `base` and `head`.
    fn changes_between(&self, base: &str, head: &str) -> Result<Vec<SourceChange>>;

    /// Content hash of `dir` (relative to the root) at `commit`, or `None`
    /// when the directory does not exist there.
    fn content_hash(&self, dir: &str, commit: &str) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Source control backed by the `git` command line.
pub struct GitSourceControl {
    repo: PathBuf,
}

impl GitSourceControl {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .map_err(|e| StrataError::SourceControl(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrataError::SourceControl(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Parse `git status --porcelain=v1` output.
fn parse_porcelain(text: &str) -> Vec<SourceChange> {
    text.lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = &line[..2];
            let path = &line[3..];
            let change_type = if code == "??" {
                ChangeType::Untracked
            } else if code.contains('R') {
                ChangeType::Renamed
            } else if code.contains('A') {
                ChangeType::Added
            } else if code.contains('D') {
                ChangeType::Deleted
            } else {
                ChangeType::Modified
            };
            let path = match path.split_once(" -> ") {
                Some((_, renamed_to)) => renamed_to,
                None => path,
            };
            SourceChange::new(path.trim_matches('"'), change_type)
        })
        .collect()
}

/// Parse `git diff --name-status` output.
fn parse_name_status(text: &str) -> Vec<SourceChange> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let status = fields.next()?;
            let paths: Vec<&str> = fields.collect();
            let change_type = match status.chars().next()? {
                'A' => ChangeType::Added,
                'D' => ChangeType::Deleted,
                'R' | 'C' => ChangeType::Renamed,
                _ => ChangeType::Modified,
            };
            paths
                .last()
                .map(|path| SourceChange::new(*path, change_type))
        })
        .collect()
}

impl SourceControl for GitSourceControl {
    fn head_commit(&self) -> Result<String> {
        let sha = self.run_git(&["rev-parse", "HEAD"])?.trim().to_string();
        if sha.is_empty() {
            return Err(StrataError::SourceControl(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(sha)
    }

    fn pending_changes(&self) -> Result<Vec<SourceChange>> {
        let out = self.run_git(&["status", "--porcelain=v1", "-uall"])?;
        Ok(parse_porcelain(&out))
    }

    fn changes_between(&self, base: &str, head: &str) -> Result<Vec<SourceChange>> {
        let out = self.run_git(&["diff", "--name-status", base, head])?;
        Ok(parse_name_status(&out))
    }

    fn content_hash(&self, dir: &str, commit: &str) -> Result<Option<String>> {
        let dir = dir.replace('\\', "/");
        let dir = dir.trim_matches('/');
        let spec = if dir.is_empty() || dir == "." {
            format!("{commit}^{{tree}}")
        } else {
            format!("{commit}:{dir}")
        };
        // A missing path at `commit` makes rev-parse fail; that is "no hash".
        match self.run_git(&["rev-parse", "--verify", "--quiet", &spec]) {
            Ok(out) => {
                let id = out.trim().to_string();
                Ok((!id.is_empty()).then_some(id))
            }
            Err(_) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Directory names always skipped when hashing a working tree.
const FS_ALWAYS_IGNORED: &[&str] = &[".git", ".strata"];

/// Source control over a plain directory tree.
///
/// The "commit" argument is ignored: content is hashed as it is on disk, so
/// any edit to a tracked file changes the hash. Build output directories
/// (`bin`, `obj` and the rest of the layout's ignored names) are skipped so
/// a build writing into its own module directory keeps its bucket id.
pub struct FsSourceControl {
    root: PathBuf,
    ignored: Vec<String>,
}

impl FsSourceControl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ignored_dirs(root, LayoutConfig::default().ignored_dirs)
    }

    pub fn with_ignored_dirs(root: impl Into<PathBuf>, ignored: Vec<String>) -> Self {
        let mut ignored = ignored;
        for always in FS_ALWAYS_IGNORED {
            if !ignored.iter().any(|d| d == always) {
                ignored.push(always.to_string());
            }
        }
        Self {
            root: root.into(),
            ignored,
        }
    }

    fn is_ignored(&self, name: &std::ffi::OsStr) -> bool {
        let name = name.to_string_lossy();
        self.ignored.iter().any(|d| d.eq_ignore_ascii_case(&name))
    }

    /// SHA-256 over sorted relative paths and file bytes under `dir`.
    pub fn hash_directory(&self, dir: &Path) -> Result<Option<String>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && self.is_ignored(e.file_name())));
        for entry in walker {
            let entry = entry.map_err(|e| match e.path() {
                Some(path) => StrataError::SourceControl(format!("{}: {e}", path.display())),
                None => StrataError::SourceControl(e.to_string()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let mut bytes = Vec::new();
            std::fs::File::open(entry.path())?.read_to_end(&mut bytes)?;
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }
}

impl SourceControl for FsSourceControl {
    fn head_commit(&self) -> Result<String> {
        Ok("working-tree".to_string())
    }

    fn pending_changes(&self) -> Result<Vec<SourceChange>> {
        Ok(Vec::new())
    }

    fn changes_between(&self, _base: &str, _head: &str) -> Result<Vec<SourceChange>> {
        Ok(Vec::new())
    }

    fn content_hash(&self, dir: &str, _commit: &str) -> Result<Option<String>> {
        self.hash_directory(&self.root.join(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::create_dir_all(dir.path().join("src/Core")).unwrap();
        std::fs::write(dir.path().join("src/Core/lib.txt"), "core v1").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn porcelain_parsing_covers_codes() {
        let text = " M src/a.txt\n?? new.txt\nA  added.txt\n D gone.txt\nR  old.txt -> moved.txt\n";
        let changes = parse_porcelain(text);
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[0], SourceChange::new("src/a.txt", ChangeType::Modified));
        assert_eq!(changes[1].change_type, ChangeType::Untracked);
        assert_eq!(changes[2].change_type, ChangeType::Added);
        assert_eq!(changes[3].change_type, ChangeType::Deleted);
        assert_eq!(changes[4], SourceChange::new("moved.txt", ChangeType::Renamed));
    }

    #[test]
    fn name_status_parsing_takes_new_path() {
        let changes = parse_name_status("M\ta.txt\nR100\told.txt\tnew.txt\nD\tx.txt\n");
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[1], SourceChange::new("new.txt", ChangeType::Renamed));
        assert_eq!(changes[2].change_type, ChangeType::Deleted);
    }

    #[test]
    fn fs_hash_is_deterministic_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let sc = FsSourceControl::new(dir.path());
        let module = dir.path().join("m");
        std::fs::create_dir_all(module.join("sub")).unwrap();
        std::fs::write(module.join("a.txt"), "alpha").unwrap();
        std::fs::write(module.join("sub/b.txt"), "beta").unwrap();

        let first = sc.hash_directory(&module).unwrap().unwrap();
        let second = sc.hash_directory(&module).unwrap().unwrap();
        assert_eq!(first, second);

        std::fs::write(module.join("sub/b.txt"), "beta!").unwrap();
        let third = sc.hash_directory(&module).unwrap().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn fs_hash_ignores_strata_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sc = FsSourceControl::with_ignored_dirs(dir.path(), Vec::new());
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let before = sc.hash_directory(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join(".strata")).unwrap();
        std::fs::write(dir.path().join(".strata/plan.json"), "{}").unwrap();
        assert_eq!(before, sc.hash_directory(dir.path()).unwrap());
    }

    #[test]
    fn fs_hash_skips_build_output_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sc = FsSourceControl::new(dir.path());
        std::fs::create_dir_all(dir.path().join("src/Core")).unwrap();
        std::fs::write(dir.path().join("src/Core/Core.proj"), "<Project/>").unwrap();
        let before = sc.content_hash("src/Core", "HEAD").unwrap();

        std::fs::create_dir_all(dir.path().join("src/Core/bin")).unwrap();
        std::fs::write(dir.path().join("src/Core/bin/Core.dll"), "binary").unwrap();
        std::fs::create_dir_all(dir.path().join("src/Core/OBJ")).unwrap();
        std::fs::write(dir.path().join("src/Core/OBJ/Core.o"), "object").unwrap();
        assert_eq!(before, sc.content_hash("src/Core", "HEAD").unwrap());

        std::fs::write(dir.path().join("src/Core/lib.txt"), "source").unwrap();
        assert_ne!(before, sc.content_hash("src/Core", "HEAD").unwrap());
    }

    #[test]
    fn fs_hash_honours_configured_ignores() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("m/dist")).unwrap();
        std::fs::write(dir.path().join("m/a.txt"), "alpha").unwrap();
        let custom = FsSourceControl::with_ignored_dirs(dir.path(), vec!["dist".to_string()]);
        let before = custom.content_hash("m", "HEAD").unwrap();
        std::fs::write(dir.path().join("m/dist/out.js"), "bundle").unwrap();
        assert_eq!(before, custom.content_hash("m", "HEAD").unwrap());

        // The default layout does not know `dist`.
        let default = FsSourceControl::new(dir.path());
        let with_dist = default.content_hash("m", "HEAD").unwrap();
        std::fs::remove_dir_all(dir.path().join("m/dist")).unwrap();
        assert_ne!(with_dist, default.content_hash("m", "HEAD").unwrap());
    }

    #[test]
    fn fs_hash_of_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sc = FsSourceControl::new(dir.path());
        assert_eq!(sc.content_hash("nope", "x").unwrap(), None);
    }

    #[test]
    fn git_tree_hash_tracks_commits() {
        let repo = make_git_repo();
        let git = GitSourceControl::new(repo.path());
        let head = git.head_commit().unwrap();
        assert_eq!(head.len(), 40);

        let h1 = git.content_hash("src/Core", &head).unwrap().unwrap();
        assert_eq!(git.content_hash("src/Missing", &head).unwrap(), None);
        assert!(git.content_hash(".", &head).unwrap().is_some());

        std::fs::write(repo.path().join("src/Core/lib.txt"), "core v2").unwrap();
        let pending = git.pending_changes().unwrap();
        assert_eq!(pending, vec![SourceChange::new("src/Core/lib.txt", ChangeType::Modified)]);

        run_git(repo.path(), &["commit", "-am", "second"]);
        let head2 = git.head_commit().unwrap();
        let h2 = git.content_hash("src/Core", &head2).unwrap().unwrap();
        assert_ne!(h1, h2);

        let diff = git.changes_between(&head, &head2).unwrap();
        assert_eq!(diff, vec![SourceChange::new("src/Core/lib.txt", ChangeType::Modified)]);
    }
}
