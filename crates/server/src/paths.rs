use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Target paths with a transfer in progress.
///
/// Two transfers of the same target would race on one `.part` file, so a
/// second claim on a held path fails until the first claim is dropped.
#[derive(Debug, Clone, Default)]
pub struct InFlightPaths {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlightPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path`, or returns `None` if another transfer holds it.
    pub fn claim(&self, path: &Path) -> Option<PathClaim> {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if !paths.insert(path.to_path_buf()) {
            return None;
        }
        Some(PathClaim {
            paths: Arc::clone(&self.paths),
            path: path.to_path_buf(),
        })
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.contains(path)
    }

    pub fn len(&self) -> usize {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one target path, released on drop.
#[derive(Debug)]
pub struct PathClaim {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl PathClaim {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let paths = InFlightPaths::new();
        let target = Path::new("shared/report.pdf");

        let first = paths.claim(target).unwrap();
        assert!(paths.is_claimed(target));
        assert!(paths.claim(target).is_none());

        drop(first);
        assert!(paths.is_empty());
        assert!(paths.claim(target).is_some());
    }

    #[test]
    fn distinct_paths_are_independent() {
        let paths = InFlightPaths::new();
        let _a = paths.claim(Path::new("a.bin")).unwrap();
        let b = paths.claim(Path::new("b.bin")).unwrap();
        assert_eq!(b.path(), Path::new("b.bin"));
        assert_eq!(paths.len(), 2);
    }
}
