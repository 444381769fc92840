//! Persistent state: a single JSON document under the web root, mirrored in
//! memory and replaced atomically on every save.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};

pub const TAG_WIP: &str = "WIP";
pub const TAG_UNRESOLVED: &str = "Unresolved comments";

/// Composite key in a result map: the prepare/rebase outcome that gates the
/// per-arch builds.
pub const ALL_ARCHES: &str = "*";

/// Per-architecture build outcome. `ok == None` means not built yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchResult {
   pub ok: Option<bool>,
   #[serde(default)]
   pub warnings: u32,
   #[serde(default)]
   pub errors: u32,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub message: Option<String>,
}

pub type ResultMap = BTreeMap<String, ArchResult>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
   pub parent: String,
   pub version: u32,
   pub time: i64,
   /// Artifacts purged under disk pressure; log HTML remains.
   #[serde(default)]
   pub logs_only: bool,
   pub rebased: ResultMap,
   #[serde(default)]
   pub picked: ResultMap,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChangeTimes {
   pub create: i64,
   pub version: i64,
   pub update: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentArch {
   pub ok: Option<bool>,
   pub msg: String,
}

/// Snapshot of the last review we posted for a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentReview {
   pub version: i64,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub parent: Option<String>,
   #[serde(default)]
   pub arches: BTreeMap<String, SentArch>,
}

impl Default for SentReview {
   fn default() -> Self {
      Self { version: -1, parent: None, arches: BTreeMap::new() }
   }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
   /// Legacy integer change number.
   pub id: u64,
   pub title: String,
   pub version: u32,
   #[serde(rename = "ref")]
   pub ref_name: String,
   pub time: ChangeTimes,
   #[serde(default)]
   pub tags: BTreeSet<String>,
   #[serde(default)]
   pub review: i32,
   #[serde(default)]
   pub sent_review: SentReview,
   #[serde(default)]
   pub build: Vec<BuildRecord>,
   /// Only meaningful in `done`: time of the newest build, or 0.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub lastbuild: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
   pub commit: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub parent: Option<String>,
   pub title: String,
   pub time: i64,
   pub result: ResultMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
   #[serde(default)]
   pub change: BTreeMap<String, ChangeRecord>,
   #[serde(default)]
   pub done: BTreeMap<String, ChangeRecord>,
   #[serde(default)]
   pub queued: Vec<String>,
   #[serde(default)]
   pub release: BTreeMap<String, ReleaseRecord>,
   #[serde(default)]
   pub current: Option<String>,
   #[serde(default)]
   pub time: i64,
}

pub struct Store {
   path: PathBuf,
   backup: PathBuf,
   pub data: StoreData,
}

impl Store {
   /// Open the store under `www_root`. A leftover backup file is a crash
   /// marker: the last save never completed and no recovery is attempted.
   pub fn open(www_root: &Path) -> Result<Self> {
      let path = www_root.join("builds.json");
      let backup = www_root.join("builds.json.bck");
      if backup.exists() {
         return Err(BotError::BrokenStore(format!("{} exists", backup.display())));
      }
      let data = match std::fs::read_to_string(&path) {
         Ok(contents) => serde_json::from_str(&contents)
            .map_err(|e| BotError::BrokenStore(format!("{}: {e}", path.display())))?,
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
         Err(e) => return Err(e.into()),
      };
      Ok(Self { path, backup, data })
   }

   /// Write-then-rename: the primary document is never half-written.
   pub fn save(&mut self) -> Result<()> {
      self.data.time = now();
      let serialized = serde_json::to_string(&self.data)?;
      let mut file = std::fs::File::create(&self.backup)?;
      file.write_all(serialized.as_bytes())?;
      file.flush()?;
      file.sync_all()?;
      drop(file);
      std::fs::rename(&self.backup, &self.path)?;
      Ok(())
   }

   /// Refresh (or create) a proposal from the review server. A record coming
   /// back from `done` starts over; its old history is gone from the store.
   pub fn set_change_info(&mut self, cid: &str, info: ChangeRecord) {
      if let Some(existing) = self.data.change.get_mut(cid) {
         existing.id = info.id;
         existing.title = info.title;
         existing.version = info.version;
         existing.ref_name = info.ref_name;
         existing.time = info.time;
         existing.tags = info.tags;
         existing.review = info.review;
      } else {
         self.data.change.insert(cid.to_string(), info);
      }
      self.data.done.remove(cid);
   }

   /// Move a proposal that is no longer open into `done`.
   pub fn set_change_done(&mut self, cid: &str) {
      if let Some(mut change) = self.data.change.remove(cid) {
         change.lastbuild = Some(change.build.iter().map(|b| b.time).max().unwrap_or(0));
         self.data.done.insert(cid.to_string(), change);
      }
      self.data.queued.retain(|queued| queued != cid);
   }

   pub fn change_or_done(&self, cid: &str) -> Option<&ChangeRecord> {
      self.data.change.get(cid).or_else(|| self.data.done.get(cid))
   }

   pub fn latest_build(&self, cid: &str) -> Option<&BuildRecord> {
      self.data.change.get(cid).and_then(|change| change.build.last())
   }

   /// Per-version counts of broken builds for a proposal, newest build
   /// scanned first, stopping at the first working one. A build only counts
   /// as broken when its baseline was fine for the same architectures.
   /// None when a referenced result or release is missing.
   pub fn broken_streaks(&self, cid: &str, arches: &[&str]) -> Option<Vec<u32>> {
      let change = self.data.change.get(cid)?;
      let mut broken = vec![0u32; change.version as usize + 1];
      for build in change.build.iter().rev() {
         let rebased_ok = all_ok_for(&build.rebased, arches)?;
         let picked_ok =
            !build.picked.is_empty() && all_ok_for(&build.picked, arches).unwrap_or(false);
         if rebased_ok || picked_ok {
            return Some(broken);
         }
         let release = self.data.release.get(&build.parent)?;
         if all_ok_for(&release.result, arches)? {
            if let Some(slot) = broken.get_mut(build.version as usize) {
               *slot += 1;
            }
         }
      }
      Some(broken)
   }

   /// Releases nothing references any more (minus the current one), split
   /// into fully-droppable and only-referenced-by-logs_only-builds.
   pub fn unused_releases(&self) -> (BTreeSet<String>, BTreeSet<String>) {
      let mut unused: BTreeSet<String> = self.data.release.keys().cloned().collect();
      if let Some(current) = &self.data.current {
         unused.remove(current);
      }
      let mut used = BTreeSet::new();
      let mut logs = BTreeSet::new();
      for change in self.data.change.values().chain(self.data.done.values()) {
         for build in &change.build {
            if build.logs_only {
               logs.insert(build.parent.clone());
            } else {
               used.insert(build.parent.clone());
            }
         }
      }
      logs = logs.difference(&used).cloned().collect();
      unused = unused.difference(&used).cloned().collect();
      unused = unused.difference(&logs).cloned().collect();
      (unused, logs)
   }
}

/// First architecture (composite `*` included) whose result is not a
/// successful build, or None when everything is OK.
pub fn broken_arch(result: &ResultMap) -> Option<&str> {
   result
      .iter()
      .find(|(_, arch)| arch.ok != Some(true))
      .map(|(name, _)| name.as_str())
}

fn all_ok_for(result: &ResultMap, arches: &[&str]) -> Option<bool> {
   let mut ok = true;
   for arch in arches {
      ok &= result.get(*arch)?.ok == Some(true);
   }
   Some(ok)
}

pub fn now() -> i64 {
   std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn result_map(entries: &[(&str, Option<bool>)]) -> ResultMap {
      entries
         .iter()
         .map(|(arch, ok)| {
            (arch.to_string(), ArchResult { ok: *ok, ..Default::default() })
         })
         .collect()
   }

   fn build(parent: &str, version: u32, rebased_ok: Option<bool>) -> BuildRecord {
      BuildRecord {
         parent: parent.to_string(),
         version,
         time: 1000,
         logs_only: false,
         rebased: result_map(&[("*", Some(true)), ("x86_64", rebased_ok)]),
         picked: ResultMap::new(),
      }
   }

   fn change_with_builds(version: u32, builds: Vec<BuildRecord>) -> ChangeRecord {
      ChangeRecord {
         id: 1,
         title: "t".to_string(),
         version,
         ref_name: "refs/changes/00/1/1".to_string(),
         time: ChangeTimes::default(),
         tags: BTreeSet::new(),
         review: 0,
         sent_review: SentReview::default(),
         build: builds,
         lastbuild: None,
      }
   }

   fn release(commit: &str, ok: Option<bool>) -> ReleaseRecord {
      ReleaseRecord {
         commit: commit.to_string(),
         parent: None,
         title: "r".to_string(),
         time: 0,
         result: result_map(&[("*", Some(true)), ("x86_64", ok)]),
      }
   }

   #[test]
   fn test_save_and_reload_roundtrip() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store.data.current = Some("hrev1".to_string());
      store.data.release.insert("hrev1".to_string(), release("c1", Some(true)));
      store.save().unwrap();

      let store = Store::open(dir.path()).unwrap();
      assert_eq!(store.data.current.as_deref(), Some("hrev1"));
      assert!(store.data.release.contains_key("hrev1"));
      assert!(store.data.time > 0);
   }

   #[test]
   fn test_backup_file_is_a_crash_marker() {
      let dir = tempfile::tempdir().unwrap();
      std::fs::write(dir.path().join("builds.json.bck"), b"{}").unwrap();
      assert!(matches!(Store::open(dir.path()), Err(BotError::BrokenStore(_))));
   }

   #[test]
   fn test_set_change_done_records_lastbuild() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store
         .data
         .change
         .insert("I0a".to_string(), change_with_builds(1, vec![build("hrev1", 1, Some(true))]));
      store.data.queued = vec!["I0a".to_string()];
      store.set_change_done("I0a");
      assert!(store.data.change.is_empty());
      assert!(store.data.queued.is_empty());
      assert_eq!(store.data.done["I0a"].lastbuild, Some(1000));
   }

   #[test]
   fn test_broken_arch() {
      assert_eq!(broken_arch(&result_map(&[("x86_64", Some(true))])), None);
      assert_eq!(broken_arch(&result_map(&[("x86_64", Some(false))])), Some("x86_64"));
      // Not built yet counts as broken too.
      assert_eq!(broken_arch(&result_map(&[("x86_64", None)])), Some("x86_64"));
   }

   #[test]
   fn test_broken_streaks_counts_only_with_good_baseline() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store.data.release.insert("good".to_string(), release("c1", Some(true)));
      store.data.release.insert("bad".to_string(), release("c2", Some(false)));
      store.data.change.insert(
         "I0a".to_string(),
         change_with_builds(2, vec![
            build("good", 1, Some(false)),
            build("bad", 2, Some(false)),
            build("good", 2, Some(false)),
         ]),
      );
      // The build on the broken baseline does not count against the change.
      let broken = store.broken_streaks("I0a", &["x86_64"]).unwrap();
      assert_eq!(broken, vec![0, 1, 1]);
   }

   #[test]
   fn test_broken_streaks_stops_at_first_ok_build() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store.data.release.insert("good".to_string(), release("c1", Some(true)));
      store.data.change.insert(
         "I0a".to_string(),
         change_with_builds(2, vec![
            build("good", 1, Some(false)),
            build("good", 2, Some(true)),
            build("good", 2, Some(false)),
         ]),
      );
      let broken = store.broken_streaks("I0a", &["x86_64"]).unwrap();
      assert_eq!(broken, vec![0, 0, 1]);
   }

   #[test]
   fn test_unused_releases() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      for tag in ["hrev1", "hrev2", "hrev3", "hrev4"] {
         store.data.release.insert(tag.to_string(), release(tag, Some(true)));
      }
      store.data.current = Some("hrev4".to_string());
      let mut used = build("hrev2", 1, Some(true));
      let mut logsonly = build("hrev3", 1, Some(true));
      logsonly.logs_only = true;
      store
         .data
         .change
         .insert("I0a".to_string(), change_with_builds(1, vec![used.clone(), logsonly.clone()]));
      let (ditch, logs) = store.unused_releases();
      assert_eq!(ditch, BTreeSet::from(["hrev1".to_string()]));
      assert_eq!(logs, BTreeSet::from(["hrev3".to_string()]));
      // A full build of the same release wins over a logs_only one.
      used.parent = "hrev3".to_string();
      logsonly.parent = "hrev3".to_string();
      store
         .data
         .change
         .insert("I0b".to_string(), change_with_builds(1, vec![used, logsonly]));
      let (_, logs) = store.unused_releases();
      assert!(logs.is_empty());
   }

   #[test]
   fn test_resurrected_change_starts_fresh() {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store
         .data
         .done
         .insert("I0a".to_string(), change_with_builds(1, vec![build("hrev1", 1, Some(true))]));
      let fresh = change_with_builds(2, Vec::new());
      store.set_change_info("I0a", fresh);
      assert!(store.data.done.is_empty());
      assert!(store.data.change["I0a"].build.is_empty());
      assert_eq!(store.data.change["I0a"].version, 2);
   }
}
