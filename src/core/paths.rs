//! Working directory layout

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout of one protocol run: outputs at the root, intermediate
/// files under `extra/` and scratch files under `tmp/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    pub fn extra_dir(&self) -> PathBuf {
        self.root.join("extra")
    }

    pub fn extra_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.extra_dir().join(name)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.extra_dir())?;
        fs::create_dir_all(self.tmp_dir())
    }
}

/// `<dir>/<stem of item>.<ext>`
pub fn item_output_path(dir: &Path, item_location: &Path, ext: &str) -> PathBuf {
    let stem = item_location
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{}.{}", stem, ext))
}
