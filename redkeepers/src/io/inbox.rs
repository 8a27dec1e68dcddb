//! Human-inbox intake (`Human/*`).
//!
//! Each note other than a README becomes one lead-owned critical work item;
//! the file is deleted once the item is in the backlog.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::io::paths::CoordinationPaths;
use crate::io::store::read_text;

/// One unread note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxNote {
    pub path: PathBuf,
    /// Project-relative path with forward slashes.
    pub relative_path: String,
    pub content: String,
}

fn is_readme(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.eq_ignore_ascii_case("readme"))
}

/// Unread notes in `inbox_dir`, sorted by path. Entries that resolve
/// outside the inbox (symlinks, `..`) are skipped.
pub fn read_inbox(paths: &CoordinationPaths, inbox_dir: &str) -> Result<Vec<InboxNote>> {
    let dir = paths.resolve(inbox_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let canonical_dir = dir
        .canonicalize()
        .with_context(|| format!("resolve {}", dir.display()))?;
    let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut notes = Vec::new();
    for path in entries {
        if !path.is_file() || is_readme(&path) {
            continue;
        }
        let inside = path
            .canonicalize()
            .is_ok_and(|resolved| resolved.starts_with(&canonical_dir));
        if !inside {
            warn!(path = %path.display(), "skipping inbox entry outside the inbox");
            continue;
        }
        let Some(content) = read_text(&path)? else {
            continue;
        };
        if content.trim().is_empty() {
            debug!(path = %path.display(), "skipping empty inbox note");
            continue;
        }
        notes.push(InboxNote {
            relative_path: paths.relative(&path),
            path,
            content,
        });
    }
    Ok(notes)
}

/// Delete a consumed note.
pub fn consume_note(note: &InboxNote) -> Result<()> {
    match fs::remove_file(&note.path) {
        Ok(()) => {
            info!(path = %note.relative_path, "consumed inbox note");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", note.path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_notes_except_readme_and_empty_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CoordinationPaths::new(temp.path());
        let inbox = temp.path().join("Human");
        fs::create_dir_all(inbox.join("nested")).expect("mkdir");
        fs::write(inbox.join("README.md"), "how to use").expect("write");
        fs::write(inbox.join("b-fix.txt"), "Fix the login").expect("write");
        fs::write(inbox.join("a-plan.md"), "Plan the release").expect("write");
        fs::write(inbox.join("blank.md"), "   ").expect("write");

        let notes = read_inbox(&paths, "Human").expect("read");
        let rels: Vec<&str> = notes.iter().map(|n| n.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["Human/a-plan.md", "Human/b-fix.txt"]);

        consume_note(&notes[0]).expect("consume");
        assert!(!inbox.join("a-plan.md").exists());
        assert_eq!(read_inbox(&paths, "Human").expect("read").len(), 1);
    }

    #[test]
    fn missing_inbox_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CoordinationPaths::new(temp.path());
        assert!(read_inbox(&paths, "Human").expect("read").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_inbox_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CoordinationPaths::new(temp.path());
        let inbox = temp.path().join("Human");
        fs::create_dir_all(&inbox).expect("mkdir");
        fs::write(temp.path().join("secret.txt"), "outside").expect("write");
        std::os::unix::fs::symlink(temp.path().join("secret.txt"), inbox.join("link.txt")).expect("symlink");
        assert!(read_inbox(&paths, "Human").expect("read").is_empty());
    }
}
