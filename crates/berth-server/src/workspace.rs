//! Workspace seeding: populate an instance's workspace directory from an
//! uploaded zip archive or a remote git repository before first start.

use std::fs;
use std::path::Path;

use anyhow::Context;

#[derive(Debug, Clone)]
pub enum WorkspaceSeed {
    Zip(std::path::PathBuf),
    GitRepo(String),
}

pub async fn seed(seed: &WorkspaceSeed, target: &Path) -> anyhow::Result<()> {
    match seed {
        WorkspaceSeed::Zip(archive) => {
            tracing::info!(archive = %archive.display(), target = %target.display(), "seeding workspace from zip archive");
            extract_zip(archive, target)
        }
        WorkspaceSeed::GitRepo(url) => {
            tracing::info!(url = %url, target = %target.display(), "seeding workspace from git repository");
            clone_repo(url, target).await
        }
    }
}

/// Extract an archive into `target`. Entries that escape the target directory
/// are skipped rather than failing the whole seed.
pub fn extract_zip(archive_path: &Path, target: &Path) -> anyhow::Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("open archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("read zip archive")?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!(name = %entry.name(), "skipping zip entry with unsafe path");
            continue;
        };
        let out_path = target.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("create directory {}", out_path.display()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create file {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract {}", out_path.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

async fn clone_repo(url: &str, target: &Path) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(target)
        .output()
        .await
        .context("run git clone")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git clone failed: {}", stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_zip(path: &Path) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        writer.add_directory("src/", options).unwrap();
        writer.start_file("README.md", options).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.start_file("src/main.py", options).unwrap();
        writer.write_all(b"print('hi')").unwrap();
        // A traversal entry that must not land outside the target.
        writer.start_file("../evil.txt", options).unwrap();
        writer.write_all(b"nope").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn extract_zip_populates_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("seed.zip");
        write_test_zip(&archive);

        let target = dir.path().join("workspace");
        fs::create_dir_all(&target).unwrap();
        extract_zip(&archive, &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("README.md")).unwrap(), "hello");
        assert!(target.join("src/main.py").exists());
    }

    #[test]
    fn extract_zip_skips_traversal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("seed.zip");
        write_test_zip(&archive);

        let target = dir.path().join("inner").join("workspace");
        fs::create_dir_all(&target).unwrap();
        extract_zip(&archive, &target).unwrap();

        assert!(!dir.path().join("inner").join("evil.txt").exists());
        assert!(!target.join("../evil.txt").exists());
    }

    #[test]
    fn extract_zip_fails_on_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(&dir.path().join("absent.zip"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("open archive"));
    }

    #[tokio::test]
    async fn clone_repo_surfaces_git_failures() {
        let dir = tempfile::tempdir().unwrap();
        let err = clone_repo("file:///nonexistent/repo.git", &dir.path().join("ws"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("git clone"));
    }
}
