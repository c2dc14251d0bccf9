//! Input enumeration for `-f` arguments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Expand `-f` arguments into the ordered list of inputs to resolve.
///
/// Files pass through as given, `-` means stdin, and directories are walked
/// recursively for manifest files. Hidden entries are skipped. Within a
/// directory, entries are visited in name order so output order is stable.
pub fn enumerate(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
  let mut found = Vec::new();
  for input in inputs {
    if input == Path::new("-") {
      found.push(input.clone());
      continue;
    }

    let metadata = std::fs::metadata(input).with_context(|| format!("unable to read {}", input.display()))?;
    if metadata.is_dir() {
      let before = found.len();
      walk_dir(input, &mut found)?;
      if found.len() == before {
        bail!("no manifest files found under {}", input.display());
      }
    } else {
      found.push(input.clone());
    }
  }
  Ok(found)
}

fn walk_dir(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
  let mut entries: Vec<_> = std::fs::read_dir(dir)
    .with_context(|| format!("unable to read directory {}", dir.display()))?
    .collect::<std::io::Result<_>>()
    .with_context(|| format!("unable to read directory {}", dir.display()))?;
  entries.sort_by_key(|entry| entry.file_name());

  for entry in entries {
    let name = entry.file_name();
    if name.to_string_lossy().starts_with('.') {
      continue;
    }

    let path = entry.path();
    if entry.file_type()?.is_dir() {
      walk_dir(&path, found)?;
    } else if has_manifest_extension(&path) {
      found.push(path);
    }
  }
  Ok(())
}

fn has_manifest_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn touch(path: &Path) {
    std::fs::write(path, "kind: ConfigMap\n").unwrap();
  }

  #[test]
  fn files_pass_through_in_argument_order() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.yaml");
    let b = dir.path().join("b.txt");
    touch(&a);
    touch(&b);

    // Explicit files are taken as given, whatever their extension.
    let found = enumerate(&[b.clone(), a.clone()]).unwrap();
    assert_eq!(found, vec![b, a]);
  }

  #[test]
  fn stdin_marker_passes_through() {
    let found = enumerate(&[PathBuf::from("-")]).unwrap();
    assert_eq!(found, vec![PathBuf::from("-")]);
  }

  #[test]
  fn directories_are_walked_recursively_in_name_order() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    touch(&dir.path().join("b.yaml"));
    touch(&dir.path().join("a.yml"));
    touch(&dir.path().join("sub/c.json"));
    touch(&dir.path().join("notes.txt"));
    touch(&dir.path().join(".hidden.yaml"));

    let found = enumerate(&[dir.path().to_path_buf()]).unwrap();
    assert_eq!(
      found,
      vec![
        dir.path().join("a.yml"),
        dir.path().join("b.yaml"),
        dir.path().join("sub/c.json"),
      ]
    );
  }

  #[test]
  fn an_empty_directory_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = enumerate(&[dir.path().to_path_buf()]).unwrap_err();
    assert!(err.to_string().contains("no manifest files"));
  }

  #[test]
  fn missing_inputs_are_an_error() {
    let err = enumerate(&[PathBuf::from("/nonexistent/kiln.yaml")]).unwrap_err();
    assert!(err.to_string().contains("unable to read"));
  }
}
