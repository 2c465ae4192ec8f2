use crate::error::Result;
use std::fs;
use std::path::Path;

/// Recursively copy `src` into `dst`, replacing same-named files
///
/// Files already in `dst` that do not exist in `src` are left alone.
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;

    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_is_additive_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(src.join("NodePack/web")).unwrap();
        fs::write(src.join("NodePack/__init__.py"), b"new").unwrap();
        fs::write(src.join("NodePack/web/app.js"), b"js").unwrap();

        fs::create_dir_all(dst.join("NodePack")).unwrap();
        fs::write(dst.join("NodePack/__init__.py"), b"old").unwrap();
        fs::write(dst.join("NodePack/local.cfg"), b"keep").unwrap();

        let copied = copy_tree(&src, &dst).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read(dst.join("NodePack/__init__.py")).unwrap(), b"new");
        assert_eq!(fs::read(dst.join("NodePack/web/app.js")).unwrap(), b"js");
        assert_eq!(fs::read(dst.join("NodePack/local.cfg")).unwrap(), b"keep");
    }

    #[test]
    fn test_copy_tree_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(copy_tree(&temp_dir.path().join("nope"), &temp_dir.path().join("dst")).is_err());
    }
}
