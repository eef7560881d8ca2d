//! Path helpers shared by the stores and the access-control tree.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Write `content` to `dest` by staging to a sibling temp file and renaming
/// into place. Parent directories are created as needed.
pub fn write_atomic(dest: &Path, content: &[u8]) -> io::Result<()> {
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }
  let tmp = dest.with_extension("tmp");
  fs::write(&tmp, content)?;
  fs::rename(&tmp, dest)?;
  Ok(())
}

/// Compute a relative path from `from_dir` to `to`.
///
/// Both paths must be absolute or share the same root; used for symlinks
/// inside the sops tree so the repository stays relocatable.
pub fn relative_to(from_dir: &Path, to: &Path) -> PathBuf {
  let from: Vec<Component> = from_dir.components().collect();
  let to_components: Vec<Component> = to.components().collect();

  let common = from
    .iter()
    .zip(to_components.iter())
    .take_while(|(a, b)| a == b)
    .count();

  let mut result = PathBuf::new();
  for _ in common..from.len() {
    result.push("..");
  }
  for component in &to_components[common..] {
    result.push(component);
  }
  result
}

/// Copy a directory tree, replacing `dest` if it already exists.
pub fn replace_tree(src: &Path, dest: &Path) -> io::Result<()> {
  if dest.exists() {
    fs::remove_dir_all(dest)?;
  }
  fs::create_dir_all(dest)?;
  for entry in walkdir::WalkDir::new(src) {
    let entry = entry.map_err(io::Error::other)?;
    let relative = entry
      .path()
      .strip_prefix(src)
      .map_err(io::Error::other)?;
    let target = dest.join(relative);
    if entry.file_type().is_dir() {
      fs::create_dir_all(&target)?;
    } else {
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn relative_to_sibling_trees() {
    let rel = relative_to(
      Path::new("/repo/sops/secrets/web01/ssh/key/machines"),
      Path::new("/repo/sops/machines/web01"),
    );
    assert_eq!(rel, Path::new("../../../../../machines/web01"));
  }

  #[test]
  fn relative_to_descendant() {
    let rel = relative_to(Path::new("/repo"), Path::new("/repo/sops/users"));
    assert_eq!(rel, Path::new("sops/users"));
  }

  #[test]
  fn replace_tree_overwrites_destination() -> io::Result<()> {
    let tmp = TempDir::new()?;
    let src = tmp.path().join("src");
    let dest = tmp.path().join("dest");

    fs::create_dir_all(src.join("nested"))?;
    fs::write(src.join("nested/value"), b"new")?;
    fs::create_dir_all(&dest)?;
    fs::write(dest.join("stale"), b"old")?;

    replace_tree(&src, &dest)?;
    assert_eq!(fs::read(dest.join("nested/value"))?, b"new");
    assert!(!dest.join("stale").exists());
    Ok(())
  }
}
