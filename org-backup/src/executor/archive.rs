//! Compression of staged artifacts.
//!
//! Directories (bare mirrors) become `tar.gz` archives, single files
//! (metadata collections) are gzipped. Both run on the blocking pool.

use crate::utils::errors::{BackupError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Archive `src` into `dest` as a gzip-compressed tarball whose entries live
/// under `root_name/`. Returns the archive size in bytes.
pub async fn tar_gz_dir(src: &Path, dest: &Path, root_name: &str) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    let root_name = root_name.to_string();

    run_blocking(move || {
        let file = File::create(&dest)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(&root_name, &src)?;

        let encoder = builder.into_inner()?;
        encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        Ok(std::fs::metadata(&dest)?.len())
    })
    .await
}

/// Gzip `src` into `dest`. Returns the compressed size in bytes.
pub async fn gzip_file(src: &Path, dest: &Path) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();

    run_blocking(move || {
        let mut reader = BufReader::new(File::open(&src)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dest)?), Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
        Ok(std::fs::metadata(&dest)?.len())
    })
    .await
}

async fn run_blocking<F>(f: F) -> Result<u64>
where
    F: FnOnce() -> io::Result<u64> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Archive(format!("archive task failed: {}", e)))?
        .map_err(|e| BackupError::Archive(e.to_string()))
}

/// `dir/name.tar.gz`
pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.tar.gz", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tar_gz_dir_keeps_layout_under_root() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("widgets.git");
        std::fs::create_dir_all(src.join("refs/heads")).unwrap();
        std::fs::write(src.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(src.join("refs/heads/main"), "0123abcd\n").unwrap();

        let dest = archive_path(tmp.path(), "git_backup");
        let size = tar_gz_dir(&src, &dest, "widgets.git").await.unwrap();
        assert!(size > 0);

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert!(names.contains(&"widgets.git/HEAD".to_string()));
        assert!(names.contains(&"widgets.git/refs/heads/main".to_string()));
    }

    #[tokio::test]
    async fn test_gzip_file_round_trips_content() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("labels.json");
        std::fs::write(&src, r#"[{"name":"bug"}]"#).unwrap();
        let dest = tmp.path().join("labels.json.gz");

        gzip_file(&src, &dest).await.unwrap();

        let mut content = String::new();
        GzDecoder::new(File::open(&dest).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, r#"[{"name":"bug"}]"#);
    }

    #[tokio::test]
    async fn test_missing_source_is_archive_error() {
        let tmp = TempDir::new().unwrap();
        let err = tar_gz_dir(&tmp.path().join("missing"), &tmp.path().join("x.tar.gz"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }
}
