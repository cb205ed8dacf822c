//! On-disk staging area for collected reports.
//!
//! ```text
//! <local_tmp>/
//! └── working/                  # engine report, renamed to the archive stem
//!     └── log-collector-data/   # scratch: database report, time_diff.txt
//!         ├── <host>/           # one directory per hypervisor job
//!         └── ...
//! ```

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

/// Working directory name below the staging root.
pub const WORKING_DIR: &str = "working";

/// Scratch directory name below the working directory.
pub const SCRATCH_DIR: &str = "log-collector-data";

/// Prefix of generated staging roots.
pub const STAGING_PREFIX: &str = "logcollector-";

/// Validated staging directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    pub root: PathBuf,
    pub working: PathBuf,
    pub scratch: PathBuf,
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| Error::io(path, e))?;
    Ok(entries.next().is_none())
}

fn ensure_empty_dir(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Staging(format!("{} is not a directory.", path.display())));
        }
        if !is_empty_dir(path)? {
            return Err(Error::Staging(format!(
                "The {} {} is not empty. It should be empty so that reports \
                 from a prior invocation are not collected again.",
                what,
                path.display()
            )));
        }
        Ok(())
    } else {
        info!("{} does not exist. It will be created.", path.display());
        std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))
    }
}

impl Staging {
    /// Validate or create the staging tree below `root`.
    ///
    /// Every directory must either be missing or empty.
    pub fn prepare(root: &Path) -> Result<Self> {
        let working = root.join(WORKING_DIR);
        let scratch = working.join(SCRATCH_DIR);

        ensure_empty_dir(root, "directory")?;
        ensure_empty_dir(&working, "working directory")?;
        ensure_empty_dir(&scratch, "scratch directory")?;

        Ok(Self {
            root: root.to_path_buf(),
            working,
            scratch,
        })
    }

    /// Create a fresh staging tree in the system temp directory.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        Self::prepare(&dir.into_path())
    }
}
