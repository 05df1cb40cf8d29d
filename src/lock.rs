//! Exclusive ownership of a store root directory.

use crate::error::{EngineError, Result};
use fs2::FileExt;
use std::fs::File;
use std::path::Path;

/// Take the `LOCK` file under `root`. The lock lives as long as the file.
pub(crate) fn acquire_lock(root: &Path) -> Result<File> {
    let lock_file = File::create(root.join("LOCK"))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| EngineError::Locked)?;
    Ok(lock_file)
}
