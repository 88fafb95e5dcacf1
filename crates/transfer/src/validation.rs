//! Remote path checks for requests resolved under the server root.

use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Checks that `remote` names a file below the server root.
///
/// A request path must be relative, may not climb with `..`, and must keep
/// at least one name once `.` segments are ignored.
pub fn validate_remote_path(remote: &str) -> Result<(), TransferError> {
    let invalid = |why: &str| Err(TransferError::InvalidPath(format!("{why}: {remote:?}")));

    if remote.is_empty() {
        return Err(TransferError::InvalidPath("request names no path".into()));
    }

    let mut names = 0;
    for component in Path::new(remote).components() {
        match component {
            Component::Normal(_) => names += 1,
            Component::CurDir => {}
            Component::ParentDir => return invalid("leaves the server root"),
            Component::RootDir | Component::Prefix(_) => return invalid("not relative"),
        }
    }

    if names == 0 {
        return invalid("no file name");
    }
    Ok(())
}

/// Validates `remote` and joins it onto `root`.
pub fn resolve_under(root: &Path, remote: &str) -> Result<PathBuf, TransferError> {
    validate_remote_path(remote)?;
    Ok(root.join(remote))
}
