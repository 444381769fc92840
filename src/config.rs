use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{BotError, Result};

/// Top-level configuration: one `[builder]` table plus one `[arch.<name>]`
/// table per target architecture.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
   pub builder: BuilderConfig,

   #[serde(default)]
   pub arch: IndexMap<String, ArchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuilderConfig {
   /// Gerrit HTTP credentials; when either is empty, review posting is
   /// disabled but builds proceed.
   #[serde(default)]
   pub user: String,
   #[serde(default)]
   pub password: String,

   pub gerrit_url: String,
   pub project: String,

   /// Branch the proposals target (e.g. "master").
   pub branch: String,
   /// Local branch tracking the upstream tip.
   pub branch_base: String,
   /// Scratch branch the builds are run from.
   pub branch_rolling: String,

   pub worktree: PathBuf,
   pub build: PathBuf,
   pub buildtools: PathBuf,
   pub jam: PathBuf,
   pub www_root: PathBuf,

   /// URL path the `www_root` is published under.
   pub link: String,
   /// Site origin prepended to report links in reviews.
   pub site: String,

   #[serde(default = "default_max_jobs")]
   pub max_jobs: usize,

   /// Wall-clock budget for one daemon run, seconds.
   pub time_limit: u64,

   /// Free-space threshold on `www_root`, bytes.
   pub low_disk: u64,

   /// How long finished proposals keep their trees, days.
   pub keep_done: f64,
   /// Same, under disk pressure.
   pub keep_done_pressure: f64,

   /// Gerrit change-list cache age, seconds.
   #[serde(default = "default_gerrit_cache")]
   pub gerrit_cache: u64,

   #[serde(default)]
   pub archive_src: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchConfig {
   #[serde(default = "default_true")]
   pub active: bool,

   #[serde(default)]
   pub save_artifacts: bool,

   /// Jam target (e.g. "@nightly-anyboot").
   pub target: String,

   /// Whitespace-separated extra jam options.
   #[serde(default)]
   pub jam_options: String,
}

const fn default_true() -> bool {
   true
}

const fn default_max_jobs() -> usize {
   8
}

const fn default_gerrit_cache() -> u64 {
   5 * 60
}

impl ArchConfig {
   pub fn jam_options(&self) -> Vec<String> {
      self.jam_options.split_whitespace().map(str::to_string).collect()
   }
}

impl BotConfig {
   /// Load config from `$TESTBUILDS_CONFIG` or `./config.toml`.
   pub fn load() -> Result<Self> {
      let path = std::env::var("TESTBUILDS_CONFIG")
         .map_or_else(|_| PathBuf::from("config.toml"), PathBuf::from);
      Self::from_file(&path)
   }

   pub fn from_file(path: &Path) -> Result<Self> {
      let contents = std::fs::read_to_string(path).map_err(|e| {
         BotError::ConfigError(format!("failed to read {}: {e}", path.display()))
      })?;
      let mut config: Self = toml::from_str(&contents)
         .map_err(|e| BotError::ConfigError(format!("failed to parse {}: {e}", path.display())))?;
      config.arch.retain(|_, arch| arch.active);
      if config.arch.is_empty() {
         return Err(BotError::ConfigError("no active architectures".to_string()));
      }
      Ok(config)
   }

   /// Basic-auth pair, or None when credentials are not configured.
   pub fn auth(&self) -> Option<(String, String)> {
      if self.builder.user.is_empty() || self.builder.password.is_empty() {
         None
      } else {
         Some((self.builder.user.clone(), self.builder.password.clone()))
      }
   }

   pub fn arch_names(&self) -> impl Iterator<Item = &str> {
      self.arch.keys().map(String::as_str)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn sample() -> &'static str {
      r#"
[builder]
gerrit_url = "https://review.haiku-os.org"
project = "haiku"
branch = "master"
branch_base = "testbuilds-base"
branch_rolling = "testbuilds"
worktree = "/srv/builder/worktrees/haiku/testbuilds"
build = "/srv/builder/builds/haiku/testbuilds"
buildtools = "/srv/builder/builds/buildtools/master"
jam = "/srv/builder/artifacts/buildtools/jam"
www_root = "/var/www/haiku/testbuild"
link = "/testbuild"
site = "https://builds.example.org"
time_limit = 14400
low_disk = 10000000000
keep_done = 30.0
keep_done_pressure = 7.0
archive_src = true

[arch.x86_64]
save_artifacts = true
target = "@nightly-anyboot"
jam_options = "-sHAIKU_IMAGE_SIZE=900"

[arch.x86_gcc2h]
active = false
target = "@nightly-anyboot"
"#
   }

   #[test]
   fn test_parse_and_filter_inactive() {
      let config: BotConfig = toml::from_str(sample()).unwrap();
      assert_eq!(config.arch.len(), 2);
      let mut config = config;
      config.arch.retain(|_, a| a.active);
      assert_eq!(config.arch_names().collect::<Vec<_>>(), vec!["x86_64"]);
      assert_eq!(
         config.arch["x86_64"].jam_options(),
         vec!["-sHAIKU_IMAGE_SIZE=900".to_string()]
      );
   }

   #[test]
   fn test_auth_requires_both_credentials() {
      let mut config: BotConfig = toml::from_str(sample()).unwrap();
      assert!(config.auth().is_none());
      config.builder.user = "bot".to_string();
      assert!(config.auth().is_none());
      config.builder.password = "secret".to_string();
      assert_eq!(config.auth(), Some(("bot".to_string(), "secret".to_string())));
   }

   #[test]
   fn test_defaults() {
      let config: BotConfig = toml::from_str(sample()).unwrap();
      assert_eq!(config.builder.max_jobs, 8);
      assert_eq!(config.builder.gerrit_cache, 300);
      assert!(config.builder.archive_src);
   }
}
