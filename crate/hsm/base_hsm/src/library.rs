use std::path::{Path, PathBuf};

use crate::{HError, HResult};

/// Check that the configured module location points to an existing file.
///
/// The location is whatever the configuration provided; nothing is searched.
pub fn resolve_library(location: impl AsRef<Path>) -> HResult<PathBuf> {
    let location = location.as_ref();
    if location.as_os_str().is_empty() {
        return Err(HError::LibraryNotFound(
            "no PKCS#11 library configured".to_owned(),
        ));
    }
    if !location.is_file() {
        return Err(HError::LibraryNotFound(location.display().to_string()));
    }
    Ok(location.to_path_buf())
}
