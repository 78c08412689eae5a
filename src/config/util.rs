//! Configuration utility functions.

use std::path::{Path, PathBuf};

/// Find the config file by searching upward from the current directory.
///
/// An absolute `config_name` is returned as is when it exists.
///
/// ```text
/// /home/user/app/views/   ← cwd
/// /home/user/app/lumen.toml   ← found
/// ```
pub fn find_config_file(config_name: &Path) -> Option<PathBuf> {
    if config_name.is_absolute() {
        return config_name.exists().then(|| config_name.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?;
    find_upward(&cwd, config_name)
}

fn find_upward(start: &Path, config_name: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(config_name))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_upward_from_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("lumen.toml"), "").unwrap();

        let found = find_upward(&nested, Path::new("lumen.toml")).unwrap();
        assert_eq!(found, dir.path().join("lumen.toml"));
    }

    #[test]
    fn test_find_upward_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_upward(dir.path(), Path::new("no-such-config-4f1d.toml")).is_none());
    }

    #[test]
    fn test_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        assert!(find_config_file(&path).is_none());
        fs::write(&path, "").unwrap();
        assert_eq!(find_config_file(&path), Some(path));
    }
}
