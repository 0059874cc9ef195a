//! Workspace bucket setup and archive staging.
//!
//! The bucket is only a transfer relay: uploads are read once by the
//! remote server via `gsutil` and a 1-day lifecycle rule reaps anything
//! a crashed run leaves behind.

use std::io::{Cursor, Read, Write as _};
use std::path::Path;
use std::time::Duration;

use gcs_api::{CreateBucketRequest, Lifecycle, LifecycleRule, StorageClient};
use tracing::{info, warn};

use crate::{Error, Result};

const BUCKET_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the workspace bucket if it doesn't exist.
pub async fn ensure_workspace_bucket(
    storage: &StorageClient,
    project: &str,
    bucket: &str,
) -> Result<()> {
    if bucket.is_empty() {
        info!("no bucket name specified, skip creating the bucket");
        return Ok(());
    }

    let req = CreateBucketRequest {
        name: bucket.to_string(),
        lifecycle: Some(Lifecycle {
            rule: vec![LifecycleRule::delete_after_days(1)],
        }),
    };

    let created = tokio::time::timeout(BUCKET_SETUP_TIMEOUT, storage.create_bucket(project, &req))
        .await
        .map_err(|_| Error::BucketSetup(format!("creating bucket {bucket} timed out")))??;

    if created {
        info!(bucket, "bucket is set up");
    } else {
        info!(bucket, "bucket already exists");
    }
    Ok(())
}

/// Zip the workspace directory into memory.
///
/// Entry names are relative to `workspace` with `/` separators so the
/// remote `Expand-Archive` recreates the tree under the destination.
/// Symlinks are skipped: they have no portable meaning on the Windows
/// side.
pub fn zip_workspace(workspace: &Path) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    add_dir(&mut writer, workspace, workspace)?;
    Ok(writer.finish()?.into_inner())
}

fn add_dir(
    writer: &mut zip::ZipWriter<Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = std::fs::symlink_metadata(&path)?.file_type();

        if file_type.is_symlink() {
            warn!(path = %path.display(), "skipping symlink");
            continue;
        }
        if file_type.is_dir() {
            add_dir(writer, root, &path)?;
            continue;
        }

        let name = path
            .strip_prefix(root)
            .map_err(|e| Error::Internal(format!("workspace walk escaped its root: {e}")))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        writer.start_file(name, zip::write::SimpleFileOptions::default())?;
        let mut file = std::fs::File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        writer.write_all(&buf)?;
    }
    Ok(())
}

/// Upload an archive to the workspace bucket. Returns the `gs://` URL.
pub async fn upload_archive(
    storage: &StorageClient,
    bucket: &str,
    object: &str,
    data: Vec<u8>,
) -> Result<String> {
    Ok(storage.upload_object(bucket, object, data).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn zip_includes_nested_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src").join("app.ps1"), "Write-Host hi\n").unwrap();

        let bytes = zip_workspace(dir.path()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();

        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Dockerfile", "src/app.ps1"]);

        let mut content = String::new();
        archive
            .by_name("src/app.ps1")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "Write-Host hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn zip_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let bytes = zip_workspace(dir.path()).unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
    }
}
