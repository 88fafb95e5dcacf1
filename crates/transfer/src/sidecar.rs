//! `.part` sidecars.
//!
//! A download keeps its partial content in `<target>.part`; the size of that
//! file is the resume offset. An upload keeps a marker `<source>.part`
//! holding the last checkpointed offset as decimal text. The server writes
//! uploads into `<target>.part` and renames it into place once complete.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::PART_SUFFIX;

/// Returns `<target>.part`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Resume offset for a download into `local`: the size of `<local>.part`,
/// or 0 if there is none.
pub async fn download_resume_offset(local: &Path) -> io::Result<u64> {
    match tokio::fs::metadata(part_path(local)).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Reads an upload offset marker. Missing, unreadable or garbled markers
/// read as 0.
pub async fn read_offset_marker(marker: &Path) -> u64 {
    match tokio::fs::read_to_string(marker).await {
        Ok(text) => text.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

/// Overwrites an upload offset marker with `offset`.
pub async fn write_offset_marker(marker: &Path, offset: u64) -> io::Result<()> {
    tokio::fs::write(marker, format!("{offset}\n")).await
}

/// Deletes an upload offset marker; a missing marker is not an error.
pub async fn remove_offset_marker(marker: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(marker).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Resume offset for uploading `source`: its marker, clamped to the
/// current size of the source.
pub async fn upload_resume_offset(source: &Path, source_size: u64) -> u64 {
    let recorded = read_offset_marker(&part_path(source)).await;
    if recorded > source_size {
        debug!(recorded, source_size, "upload marker beyond source size, clamping");
    }
    recorded.min(source_size)
}

/// Makes a completed partial file durable and renames it to `target`.
pub async fn finalize_partial(mut file: File, part: &Path, target: &Path) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(part, target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("dir/report.pdf")),
            PathBuf::from("dir/report.pdf.part")
        );
        assert_eq!(part_path(Path::new("noext")), PathBuf::from("noext.part"));
    }

    #[tokio::test]
    async fn download_offset_is_part_size() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("video.bin");
        assert_eq!(download_resume_offset(&local).await.unwrap(), 0);

        std::fs::write(part_path(&local), vec![7u8; 300]).unwrap();
        assert_eq!(download_resume_offset(&local).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn marker_roundtrip_and_removal() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("a.bin.part");

        assert_eq!(read_offset_marker(&marker).await, 0);
        write_offset_marker(&marker, 1280).await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1280\n");
        assert_eq!(read_offset_marker(&marker).await, 1280);

        remove_offset_marker(&marker).await.unwrap();
        assert!(!marker.exists());
        // Second removal is a no-op.
        remove_offset_marker(&marker).await.unwrap();
    }

    #[tokio::test]
    async fn garbled_marker_reads_zero() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("a.bin.part");
        std::fs::write(&marker, "not a number").unwrap();
        assert_eq!(read_offset_marker(&marker).await, 0);
    }

    #[tokio::test]
    async fn upload_offset_clamped_to_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("shrunk.bin");
        std::fs::write(&source, vec![0u8; 100]).unwrap();
        write_offset_marker(&part_path(&source), 512).await.unwrap();

        assert_eq!(upload_resume_offset(&source, 100).await, 100);
        write_offset_marker(&part_path(&source), 64).await.unwrap();
        assert_eq!(upload_resume_offset(&source, 100).await, 64);
    }

    #[tokio::test]
    async fn finalize_renames_into_place() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("done.txt");
        let part = part_path(&target);

        let mut file = File::create(&part).await.unwrap();
        file.write_all(b"complete").await.unwrap();
        finalize_partial(file, &part, &target).await.unwrap();

        assert!(!part.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"complete");
    }
}
