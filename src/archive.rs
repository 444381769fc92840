//! Source archives published next to build results.

use std::path::Path;
use std::process::Command;

use crate::error::{BotError, Result};

/// Pack the worktree into `src.<changeset>_<version[_sep]>-<master>.tar.xz`
/// under `dst`, contents rooted at the same base name, VCS metadata left out.
/// A sidecar `.txt` records what the archive belongs to.
pub fn archive(
   dst: &Path,
   worktree: &Path,
   changeset: &str,
   version: &str,
   master: &str,
   full: bool,
) -> Result<()> {
   let mut version = version.to_string();
   if !full {
      version.push_str("_sep");
   }
   let base = format!("{changeset}_{version}-{master}");
   let file = dst.join(format!("src.{base}.tar.xz"));

   let comment = format!("Changeset: {changeset}\nVersion: {version}\nOver: {master}\n");
   std::fs::write(dst.join(format!("src.{base}.txt")), comment)?;

   let output = Command::new("tar")
      .arg("--create")
      .arg("--xz")
      .arg("--exclude=CVS")
      .arg("--exclude=.svn")
      .arg("--exclude=.git")
      .arg("--transform")
      .arg(format!("s,^\\.,{base},"))
      .arg("--file")
      .arg(&file)
      .arg("-C")
      .arg(worktree)
      .arg(".")
      .output()
      .map_err(|e| BotError::BuildError(format!("failed to run tar: {e}")))?;
   if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(BotError::BuildError(format!("tar failed: {}", stderr.trim())));
   }
   Ok(())
}

/// Whether a source archive already exists in `dst`; archiving takes long
/// enough that it is worth never doing twice.
pub fn has_archive(dst: &Path) -> bool {
   std::fs::read_dir(dst)
      .map(|entries| {
         entries
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("src."))
      })
      .unwrap_or(false)
}
