//! Maps logical names (per-arch build dirs, published result trees, tmpfs
//! scratch space) to filesystem locations.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::config::BuilderConfig;
use crate::error::{BotError, Result};

#[derive(Debug, Clone)]
pub struct Paths {
   worktree:        PathBuf,
   build_root:      PathBuf,
   buildtools_root: PathBuf,
   jam:             PathBuf,
   www_root:        PathBuf,
   link_root:       String,
}

impl Paths {
   pub fn new(config: &BuilderConfig) -> Self {
      Self {
         worktree:        config.worktree.clone(),
         build_root:      config.build.clone(),
         buildtools_root: config.buildtools.clone(),
         jam:             config.jam.clone(),
         www_root:        config.www_root.clone(),
         link_root:       config.link.trim_end_matches('/').to_string(),
      }
   }

   pub fn worktree(&self) -> &Path {
      &self.worktree
   }

   pub fn build_root(&self) -> &Path {
      &self.build_root
   }

   pub fn build(&self, arch: &str) -> PathBuf {
      self.build_root.join(arch)
   }

   pub fn buildtools_root(&self) -> &Path {
      &self.buildtools_root
   }

   pub fn buildtools(&self, arch: &str) -> PathBuf {
      self.buildtools_root.join(arch)
   }

   pub fn jam(&self) -> &Path {
      &self.jam
   }

   pub fn www_root(&self) -> &Path {
      &self.www_root
   }

   /// Published tree for one build of a proposal:
   /// `<www_root>/<cid>/<version[-sep]>/<parent>[/<arch>]`. The `-sep` suffix
   /// marks the cherry-picked (separate) build as opposed to the rebased one.
   pub fn www(
      &self,
      changeset: &str,
      version: u32,
      master: &str,
      arch: Option<&str>,
      full: bool,
   ) -> PathBuf {
      let mut version = version.to_string();
      if !full {
         version.push_str("-sep");
      }
      let mut path = self.www_root.join(changeset).join(version).join(master);
      if let Some(arch) = arch {
         path.push(arch);
      }
      path
   }

   /// Published tree for a baseline build:
   /// `<www_root>/release/<branch>/<tag>[/<arch>]`.
   pub fn www_release(&self, branch: &str, tag: &str, arch: Option<&str>) -> PathBuf {
      let mut path = self.www_root.join("release").join(branch).join(tag);
      if let Some(arch) = arch {
         path.push(arch);
      }
      path
   }

   pub fn link_root(&self) -> &str {
      &self.link_root
   }

   /// URL path for a location under the www root.
   pub fn www_link(&self, path: &Path) -> String {
      match path.strip_prefix(&self.www_root) {
         Ok(rest) => format!("{}/{}", self.link_root, rest.display()),
         Err(_) => self.link_root.clone(),
      }
   }

   /// Scratch directory for emulated file attributes, on the fastest
   /// available tmpfs.
   pub fn emulated_attributes(&self) -> PathBuf {
      preferred_tmp().join("haiku_testbuilds")
   }

   pub fn delete_release(&self, branch: &str, tag: &str) {
      remove_tree(&self.www_release(branch, tag, None));
   }

   pub fn delete_change(&self, changeset: &str) {
      remove_tree(&self.www_root.join(changeset));
   }

   /// Remove artifacts from a build or published directory, keeping logs.
   pub fn clean_up(&self, path: &Path) {
      remove_tree(&path.join("objects"));
      let Ok(entries) = std::fs::read_dir(path) else {
         return;
      };
      for entry in entries.flatten() {
         let name = entry.file_name();
         let name = name.to_string_lossy();
         if name == "build.err"
            || name == "build.out"
            || name == "efi.map"
            || name.starts_with("haiku.")
            || name.starts_with("haiku-")
            || name.ends_with(".hpkg")
            || name.ends_with(".iso")
            || name.ends_with(".image")
         {
            let _ = std::fs::remove_file(entry.path());
         }
      }
   }
}

/// rmtree with ENOENT (and everything else) swallowed; cleanup is idempotent.
pub fn remove_tree(path: &Path) {
   let _ = std::fs::remove_dir_all(path);
}

/// Fastest usable scratch root: `XDG_RUNTIME_DIR`, `/dev/shm`, `/tmp`, then
/// the system default.
pub fn preferred_tmp() -> PathBuf {
   if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
      let dir = PathBuf::from(dir);
      if dir.exists() {
         return dir;
      }
   }
   for dir in ["/dev/shm", "/tmp"] {
      let dir = PathBuf::from(dir);
      if dir.exists() {
         return dir;
      }
   }
   std::env::temp_dir()
}

/// Relative path from `from` (a directory) to `to`. Both must be absolute.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
   let from: Vec<Component> = from.components().collect();
   let to: Vec<Component> = to.components().collect();
   let common = from.iter().zip(to.iter()).take_while(|(a, b)| a == b).count();
   let mut result = PathBuf::new();
   for _ in common..from.len() {
      result.push("..");
   }
   for component in &to[common..] {
      result.push(component);
   }
   if result.as_os_str().is_empty() {
      result.push(".");
   }
   result
}

/// Free bytes on the filesystem holding `path`.
pub fn free_disk_space(path: &Path) -> Result<u64> {
   let cpath = CString::new(path.as_os_str().as_bytes())
      .map_err(|e| BotError::Other(format!("bad path for statvfs: {e}")))?;
   let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
   // SAFETY: cpath is a valid NUL-terminated string and stat is zeroed
   // statvfs-sized storage.
   let rc = unsafe { libc::statvfs(cpath.as_ptr(), &raw mut stat) };
   if rc != 0 {
      return Err(BotError::IoError(std::io::Error::last_os_error()));
   }
   Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::BotConfig;

   fn paths() -> Paths {
      let config: BotConfig = toml::from_str(
         r#"
[builder]
gerrit_url = "https://review.haiku-os.org"
project = "haiku"
branch = "master"
branch_base = "base"
branch_rolling = "rolling"
worktree = "/srv/builder/worktrees/haiku/testbuilds"
build = "/srv/builder/builds/haiku/testbuilds"
buildtools = "/srv/builder/builds/buildtools/master"
jam = "/srv/builder/artifacts/jam"
www_root = "/var/www/haiku/testbuild"
link = "/testbuild/"
site = "https://builds.example.org"
time_limit = 1
low_disk = 1
keep_done = 1.0
keep_done_pressure = 1.0

[arch.x86_64]
target = "@nightly-anyboot"
"#,
      )
      .unwrap();
      Paths::new(&config.builder)
   }

   #[test]
   fn test_www_layout() {
      let p = paths();
      assert_eq!(
         p.www("I0abc", 3, "hrev57000", Some("x86_64"), true),
         PathBuf::from("/var/www/haiku/testbuild/I0abc/3/hrev57000/x86_64")
      );
      assert_eq!(
         p.www("I0abc", 3, "hrev57000", None, false),
         PathBuf::from("/var/www/haiku/testbuild/I0abc/3-sep/hrev57000")
      );
      assert_eq!(
         p.www_release("master", "hrev57000", Some("x86_64")),
         PathBuf::from("/var/www/haiku/testbuild/release/master/hrev57000/x86_64")
      );
   }

   #[test]
   fn test_www_link() {
      let p = paths();
      let path = p.www("I0abc", 3, "hrev57000", None, true);
      assert_eq!(p.www_link(&path), "/testbuild/I0abc/3/hrev57000");
      assert_eq!(p.www_link(Path::new("/elsewhere")), "/testbuild");
   }

   #[test]
   fn test_relative_path() {
      assert_eq!(
         relative_path(Path::new("/www/I0abc/3/hrev1"), Path::new("/www/release/master/hrev1")),
         PathBuf::from("../../../release/master/hrev1")
      );
      assert_eq!(relative_path(Path::new("/a/b"), Path::new("/a/b")), PathBuf::from("."));
      assert_eq!(relative_path(Path::new("/a/b"), Path::new("/a/b/c")), PathBuf::from("c"));
   }
}
