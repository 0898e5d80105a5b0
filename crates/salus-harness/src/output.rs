//! Scratch directory that is published into the final output directory on exit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::TempDir;

use crate::error::{Error, Result};

/// RAM-backed location used for scratch directories when available.
pub fn default_scratch_root() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

pub struct AtomicOutputArea {
    final_dir: PathBuf,
    scratch: Option<TempDir>,
    merge_on_failure: bool,
}

impl AtomicOutputArea {
    /// Creates `final_dir` if needed and a fresh scratch directory under `scratch_root`.
    ///
    /// With `merge_on_failure` the scratch contents are published even when the body failed,
    /// otherwise a failed body discards them.
    pub fn enter(final_dir: &Path, scratch_root: &Path, merge_on_failure: bool) -> Result<Self> {
        if final_dir.exists() && !final_dir.is_dir() {
            return Err(Error::DestExistsNotDir(final_dir.to_path_buf()));
        }
        fs::create_dir_all(final_dir)?;
        fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new().prefix("salus-").tempdir_in(scratch_root)?;
        debug!("scratch area {} for {}", scratch.path().display(), final_dir.display());
        Ok(Self {
            final_dir: final_dir.to_path_buf(),
            scratch: Some(scratch),
            merge_on_failure,
        })
    }

    pub fn scratch(&self) -> &Path {
        self.scratch.as_ref().map(|s| s.path()).unwrap_or(&self.final_dir)
    }

    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    /// Publishes the scratch contents, or discards them when the body failed and the area is strict.
    pub fn exit(mut self, succeeded: bool) -> Result<()> {
        self.finish(succeeded)
    }

    fn finish(&mut self, succeeded: bool) -> Result<()> {
        let Some(scratch) = self.scratch.take() else {
            return Ok(());
        };
        if !succeeded {
            if !self.merge_on_failure {
                info!("discarding scratch area {}", scratch.path().display());
                return Ok(());
            }
            warn!("run failed, publishing partial results to {}", self.final_dir.display());
        }
        match merge_dir(scratch.path(), &self.final_dir) {
            Ok(()) => {
                if let Err(e) = scratch.close() {
                    warn!("failed to remove scratch area: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                let kept = scratch.keep();
                warn!("leaving unmerged results in {}", kept.display());
                Err(e)
            }
        }
    }
}

impl Drop for AtomicOutputArea {
    fn drop(&mut self) {
        if let Err(e) = self.finish(false) {
            warn!("failed to publish {}: {}", self.final_dir.display(), e);
        }
    }
}

/// Moves every entry of `src` into `dst`, descending into directories present on both sides.
pub fn merge_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        match fs::symlink_metadata(&to) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => move_path(&from, &to)?,
            Err(e) => return Err(e.into()),
            Ok(meta) if meta.is_dir() && entry.file_type()?.is_dir() => merge_dir(&from, &to)?,
            Ok(_) => return Err(Error::DestExistsNotDir(to)),
        }
    }
    Ok(())
}

pub(crate) fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_recursive(from, to)?;
            if from.is_dir() {
                fs::remove_dir_all(from)
            } else {
                fs::remove_file(from)
            }
        }
        other => other,
    }
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_on_success() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out");
        fs::create_dir_all(dest.join("sub")).unwrap();
        fs::write(dest.join("sub").join("old.txt"), "old").unwrap();

        let area = AtomicOutputArea::enter(&dest, &root.path().join("scratch"), false).unwrap();
        let scratch = area.scratch().to_path_buf();
        fs::create_dir_all(scratch.join("sub")).unwrap();
        fs::write(scratch.join("sub").join("new.txt"), "new").unwrap();
        fs::write(scratch.join("top.txt"), "top").unwrap();
        area.exit(true).unwrap();

        assert_eq!(fs::read_to_string(dest.join("sub").join("old.txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(dest.join("sub").join("new.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dest.join("top.txt")).unwrap(), "top");
        assert!(!scratch.exists());
    }

    #[test]
    fn test_strict_area_discards_on_failure() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out");
        let area = AtomicOutputArea::enter(&dest, root.path(), false).unwrap();
        fs::write(area.scratch().join("partial.txt"), "x").unwrap();
        area.exit(false).unwrap();
        assert!(dest.is_dir());
        assert!(!dest.join("partial.txt").exists());
    }

    #[test]
    fn test_tolerant_area_merges_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("out");
        {
            let area = AtomicOutputArea::enter(&dest, root.path(), true).unwrap();
            fs::write(area.scratch().join("partial.txt"), "x").unwrap();
        }
        assert!(dest.join("partial.txt").exists());
    }

    #[test]
    fn test_conflicts() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            AtomicOutputArea::enter(&file, root.path(), true),
            Err(Error::DestExistsNotDir(_))
        ));

        let dest = root.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("taken"), "").unwrap();
        let area = AtomicOutputArea::enter(&dest, root.path(), true).unwrap();
        fs::create_dir_all(area.scratch().join("taken")).unwrap();
        let scratch = area.scratch().to_path_buf();
        assert!(matches!(area.exit(true), Err(Error::DestExistsNotDir(_))));
        // unmerged results stay on disk
        assert!(scratch.join("taken").is_dir());
    }
}
