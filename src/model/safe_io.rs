use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::Builder;
use thiserror::Error;
use tracing::debug;

/// 报告输出路径不可用
#[derive(Error, Debug)]
pub enum OutputPathError {
    #[error("[E_OUTPUT_SYMLINK] 输出路径是符号链接，已拒绝写入: {}", .0.display())]
    Symlink(PathBuf),

    #[error("[E_OUTPUT_DIR] 输出路径是一个目录: {}", .0.display())]
    Directory(PathBuf),

    #[error("[E_OUTPUT_PARENT] 输出目录不存在: {}", .0.display())]
    MissingParent(PathBuf),
}

/// 报告写入：同目录临时文件落盘后重命名，再同步父目录。
/// 读者只会看到旧报告或完整的新报告。
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let parent = output_dir(path)?;
    check_target(path)?;

    let mut tmp = Builder::new()
        .prefix(".p1203_tmp_")
        .suffix(".part")
        .tempfile_in(parent)
        .with_context(|| format!("无法在输出目录创建临时报告: {}", parent.display()))?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .with_context(|| format!("临时报告落盘失败: {}", path.display()))?;

    // 临时文件写入期间目标可能被替换
    check_target(path)?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("替换报告文件失败: {}", path.display()))?;

    sync_dir(parent);
    debug!(path = %path.display(), bytes = data.len(), "报告已原子写入");
    Ok(())
}

pub fn atomic_write_string(path: &Path, content: &str) -> Result<()> {
    atomic_write_bytes(path, content.as_bytes())
}

/// 相对文件名的父目录为空，视为当前目录
fn output_dir(path: &Path) -> Result<&Path> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Err(OutputPathError::Directory(path.to_path_buf()).into()),
    };
    if !parent.is_dir() {
        return Err(OutputPathError::MissingParent(parent.to_path_buf()).into());
    }
    Ok(parent)
}

fn check_target(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if metadata.file_type().is_symlink() {
        return Err(OutputPathError::Symlink(path.to_path_buf()).into());
    }
    if metadata.is_dir() {
        return Err(OutputPathError::Directory(path.to_path_buf()).into());
    }
    Ok(())
}

/// 重命名之后同步目录项；部分平台不支持打开目录，失败只记录
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "输出目录同步失败");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn leftovers(dir: &Path) -> usize {
        fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".p1203_tmp_"))
            .count()
    }

    #[test]
    fn test_replaces_existing_report() {
        let dir = TempDir::new().expect("tempdir");
        let output = dir.path().join("report.json");
        fs::write(&output, "{}").expect("seed");

        atomic_write_string(&output, "{\"a\": 1}").expect("write failed");
        assert_eq!(fs::read_to_string(&output).expect("read"), "{\"a\": 1}");
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[test]
    fn test_rejects_directory_and_missing_parent() {
        let dir = TempDir::new().expect("tempdir");

        let err = atomic_write_string(dir.path(), "x").expect_err("directory target");
        assert!(matches!(
            err.downcast_ref::<OutputPathError>(),
            Some(OutputPathError::Directory(_))
        ));

        let missing = dir.path().join("no_such_dir").join("report.json");
        let err = atomic_write_string(&missing, "x").expect_err("missing parent");
        assert!(matches!(
            err.downcast_ref::<OutputPathError>(),
            Some(OutputPathError::MissingParent(_))
        ));
        assert_eq!(leftovers(dir.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlinked_report() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("target.json");
        fs::write(&target, "old").expect("write old");
        let link = dir.path().join("report.json");
        symlink(&target, &link).expect("symlink");

        let err = atomic_write_string(&link, "new").expect_err("should reject symlink");
        assert!(matches!(
            err.downcast_ref::<OutputPathError>(),
            Some(OutputPathError::Symlink(_))
        ));
        assert_eq!(fs::read_to_string(&target).expect("read target"), "old");
    }
}
