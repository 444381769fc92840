//! Build-scheduling policy: which proposal to build next, and what to throw
//! away when disk or time budgets run out.

use tracing::{debug, info};

use crate::builder::BuildContext;
use crate::config::BotConfig;
use crate::paths::{Paths, remove_tree};
use crate::store::{ALL_ARCHES, ChangeRecord, Store, TAG_UNRESOLVED, TAG_WIP, broken_arch};

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

const KNOB_OLD_VERSION: i64 = 10 * SECONDS_PER_DAY;
const KNOB_OLD_BUILD: i64 = 30 * SECONDS_PER_DAY;
const KNOB_MINIMUM_DELAY: i64 = SECONDS_PER_DAY;

/// A scheduling decision for one proposal: the bucket it landed in plus its
/// in-bucket sort key.
struct Entry {
   review: i32,
   key: f64,
   cid: String,
}

fn is_wip(change: &ChangeRecord) -> bool {
   change.tags.contains(TAG_WIP)
}

fn is_unresolved(change: &ChangeRecord) -> bool {
   change.tags.contains(TAG_UNRESOLVED)
}

/// Proposals worth building, highest priority first.
///
/// Buckets 0-8 hold proposals without a build of their current version,
/// ordered inside each bucket by review score and recency. Bucket 9 holds
/// proposals already built on an older baseline, ordered by a staleness
/// weight; anything below its minimum-delay threshold is skipped entirely.
/// Ties break on cid so identical inputs always produce identical queues.
pub fn sorted_changes(store: &Store, now: i64) -> Vec<String> {
   let master_broken = match &store.data.current {
      Some(current) => {
         store.data.release.get(current).is_none_or(|r| broken_arch(&r.result).is_some())
      }
      None => true,
   };

   let mut priority: Vec<Vec<Entry>> = (0..10).map(|_| Vec::new()).collect();
   for (cid, change) in &store.data.change {
      let fresh_version = now - change.time.version < 2 * SECONDS_PER_DAY;
      let wip = is_wip(change);
      let unresolved = is_unresolved(change);

      let Some(latest) = change.build.last() else {
         // Never built: buckets 0, 1, 3, 6, 8.
         if change.review < -1 && fresh_version {
            continue;
         }
         let prio = if wip {
            if unresolved { 8 } else { 6 }
         } else if master_broken {
            if unresolved { 1 } else { 0 }
         } else if unresolved {
            8
         } else {
            3
         };
         priority[prio].push(Entry {
            review: change.review,
            key: change.time.update as f64,
            cid: cid.clone(),
         });
         continue;
      };

      let both_broken = broken_arch(&latest.rebased).is_some()
         && (latest.picked.is_empty() || broken_arch(&latest.picked).is_some());

      if latest.version != change.version {
         // New version since the last build: buckets 2, 4, 5, 6, 7, 8.
         if change.review < -1 && fresh_version {
            continue;
         }
         let prio = if both_broken {
            if unresolved {
               7
            } else if wip {
               5
            } else {
               2
            }
         } else if unresolved {
            8
         } else if wip {
            6
         } else {
            4
         };
         priority[prio].push(Entry {
            review: change.review,
            key: change.time.update as f64,
            cid: cid.clone(),
         });
      } else if Some(&latest.parent) != store.data.current.as_ref() {
         // Same version, older baseline: bucket 9, by staleness weight.
         if change.review < -1 && fresh_version {
            continue;
         }

         let mut min_delay = KNOB_MINIMUM_DELAY as f64;
         // better chance the older the last build was
         let mut weight = (now - latest.time) as f64;
         // better chance for more activity
         weight += (change.time.update - latest.time).max(0) as f64 / 2.0;
         if now - change.time.version > KNOB_OLD_VERSION {
            min_delay *= 2.0;
            if now - change.time.version > 3 * KNOB_OLD_VERSION {
               weight /= 2.0;
            }
         }
         // wait more if WIP or under discussion
         if wip {
            weight -= 2.0 * SECONDS_PER_DAY as f64;
         }
         if unresolved {
            weight -= SECONDS_PER_DAY as f64;
            min_delay *= 2.0;
         }
         // try again sooner for broken builds
         if both_broken {
            weight += 2.0 * SECONDS_PER_DAY as f64;
         }
         // but not forever
         if let Some(broken) = store.broken_streaks(cid, &[ALL_ARCHES]) {
            if broken.last().copied().unwrap_or(0) > 2 {
               let total: u32 = broken.iter().sum();
               weight -= f64::from(total - 2) * SECONDS_PER_DAY as f64;
            }
         }
         let mut penalties = Vec::new();
         for arch in latest.rebased.keys().filter(|a| a.as_str() != ALL_ARCHES) {
            let penalty = store.broken_streaks(cid, &[arch.as_str()]).map_or(0, |broken| {
               if broken.last().copied().unwrap_or(0) > 2 {
                  broken.iter().sum::<u32>() - 2
               } else {
                  0
               }
            });
            penalties.push(penalty);
         }
         min_delay +=
            f64::from(penalties.iter().min().copied().unwrap_or(0)) * SECONDS_PER_DAY as f64 / 2.0;
         min_delay -= f64::from(change.review) * SECONDS_PER_DAY as f64;

         if now - latest.time > KNOB_OLD_BUILD {
            // don't forget anyone
            weight = (weight * 2.0).max(0.0);
         } else if weight <= min_delay {
            continue;
         }
         priority[9].push(Entry { review: change.review, key: weight, cid: cid.clone() });
      }
      // else: same version, same baseline; nothing to do.
   }

   let mut queue = Vec::new();
   for bucket in &mut priority {
      bucket.sort_by(|a, b| {
         b.review
            .cmp(&a.review)
            .then(b.key.total_cmp(&a.key))
            .then_with(|| a.cid.cmp(&b.cid))
      });
      queue.extend(bucket.iter().map(|entry| entry.cid.clone()));
   }
   queue
}

/// Drop finished proposals whose last build is older than `t`.
pub fn remove_done_before(
   store: &mut Store,
   builder: &BuildContext,
   t: i64,
) -> crate::error::Result<()> {
   let cids: Vec<String> = store
      .data
      .done
      .iter()
      .filter(|(_, change)| change.lastbuild.unwrap_or(0) < t)
      .map(|(cid, _)| cid.clone())
      .collect();
   builder.remove_done_changes(store, &cids)
}

/// Delete releases nothing references and strip artifacts from those only
/// log-referenced.
pub fn remove_unused_releases(store: &mut Store, paths: &Paths, branch: &str) {
   let (ditch, clean) = store.unused_releases();
   for tag in ditch {
      paths.delete_release(branch, &tag);
      store.data.release.remove(&tag);
   }
   for tag in clean {
      let Some(release) = store.data.release.get(&tag) else {
         continue;
      };
      for arch in release.result.keys().filter(|a| a.as_str() != ALL_ARCHES) {
         paths.clean_up(&paths.www_release(branch, &tag, Some(arch)));
      }
   }
}

/// First line of disk-pressure defence: truncate build history to the last
/// one (done) or three (active) builds per proposal, pinning the build the
/// last sent review refers to, and drop the trees of everything removed.
pub fn remove_old_harder(
   store: &mut Store,
   builder: &BuildContext,
   paths: &Paths,
   config: &BotConfig,
   now: i64,
) -> crate::error::Result<()> {
   info!("low disk space, trimming build history");
   remove_done_before(
      store,
      builder,
      now - (config.builder.keep_done_pressure * SECONDS_PER_DAY as f64) as i64,
   )?;
   for (done, limit) in [(false, 3usize), (true, 1usize)] {
      let group = if done { &mut store.data.done } else { &mut store.data.change };
      for (cid, change) in group.iter_mut() {
         let keep = change.sent_review.parent.clone();
         let n = change.build.len().saturating_sub(limit);
         let removed: Vec<crate::store::BuildRecord> = change.build.drain(..n).collect();
         for old in removed {
            if keep.as_deref() == Some(old.parent.as_str()) {
               change.build.insert(0, old);
            } else {
               remove_tree(&paths.www(cid, old.version, &old.parent, None, true));
               if !old.picked.is_empty() {
                  remove_tree(&paths.www(cid, old.version, &old.parent, None, false));
               }
            }
         }
      }
   }
   remove_unused_releases(store, paths, &config.builder.branch);
   store.save()
}

/// Second line: keep only logs for every build but each proposal's newest.
pub fn remove_old_starved(store: &mut Store, paths: &Paths) -> crate::error::Result<()> {
   info!("still low on disk space, dropping artifacts");
   for group in [&mut store.data.change, &mut store.data.done] {
      for (cid, change) in group.iter_mut() {
         let n = change.build.len().saturating_sub(1);
         for old in &mut change.build[..n] {
            for (full, side) in [(true, &old.rebased), (false, &old.picked)] {
               for arch in side.keys().filter(|a| a.as_str() != ALL_ARCHES) {
                  paths.clean_up(&paths.www(cid, old.version, &old.parent, Some(arch), full));
               }
            }
            if !old.logs_only {
               debug!(%cid, version = old.version, parent = %old.parent, "keeping logs only");
               old.logs_only = true;
            }
         }
      }
   }
   store.save()
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::store::{ArchResult, BuildRecord, ChangeTimes, ReleaseRecord, ResultMap, SentReview};
   use std::collections::BTreeMap;

   const DAY: i64 = SECONDS_PER_DAY;
   const NOW: i64 = 1_000 * DAY;

   fn result_map(ok: Option<bool>) -> ResultMap {
      BTreeMap::from([
         ("*".to_string(), ArchResult { ok: Some(true), ..Default::default() }),
         ("x86_64".to_string(), ArchResult { ok, ..Default::default() }),
      ])
   }

   fn change(review: i32, tags: &[&str], version: u32) -> ChangeRecord {
      ChangeRecord {
         id: 1,
         title: "t".to_string(),
         version,
         ref_name: String::new(),
         time: ChangeTimes {
            create: NOW - 30 * DAY,
            version: NOW - 5 * DAY,
            update: NOW - 3 * DAY,
         },
         tags: tags.iter().map(|t| t.to_string()).collect(),
         review,
         sent_review: SentReview::default(),
         build: Vec::new(),
         lastbuild: None,
      }
   }

   fn build(parent: &str, version: u32, ok: bool, age_days: i64) -> BuildRecord {
      BuildRecord {
         parent: parent.to_string(),
         version,
         time: NOW - age_days * DAY,
         logs_only: false,
         rebased: result_map(Some(ok)),
         picked: ResultMap::new(),
      }
   }

   fn store_with_release(ok: bool) -> (tempfile::TempDir, Store) {
      let dir = tempfile::tempdir().unwrap();
      let mut store = Store::open(dir.path()).unwrap();
      store.data.current = Some("hrev2".to_string());
      for tag in ["hrev1", "hrev2"] {
         store.data.release.insert(tag.to_string(), ReleaseRecord {
            commit: tag.to_string(),
            parent: None,
            title: String::new(),
            time: 0,
            result: result_map(Some(ok)),
         });
      }
      (dir, store)
   }

   #[test]
   fn test_fresh_change_lands_in_bucket_3() {
      let (_dir, mut store) = store_with_release(true);
      store.data.change.insert("I0a".to_string(), change(0, &[], 1));
      assert_eq!(sorted_changes(&store, NOW), vec!["I0a".to_string()]);
   }

   #[test]
   fn test_broken_master_promotes_new_changes() {
      let (_dir, mut store) = store_with_release(false);
      store.data.change.insert("I0a".to_string(), change(0, &[], 1));
      store.data.change.insert("I0b".to_string(), change(0, &[TAG_UNRESOLVED], 1));
      store.data.change.insert("I0c".to_string(), change(0, &[TAG_WIP], 1));
      // bucket 0 first, then 1, then the WIP in 6.
      assert_eq!(sorted_changes(&store, NOW), vec![
         "I0a".to_string(),
         "I0b".to_string(),
         "I0c".to_string()
      ]);
   }

   #[test]
   fn test_rejected_fresh_version_skipped() {
      let (_dir, mut store) = store_with_release(true);
      let mut rejected = change(-2, &[], 1);
      rejected.time.version = NOW - DAY;
      store.data.change.insert("I0a".to_string(), rejected);
      assert!(sorted_changes(&store, NOW).is_empty());
      // Old enough versions are considered again.
      store.data.change.get_mut("I0a").unwrap().time.version = NOW - 3 * DAY;
      assert_eq!(sorted_changes(&store, NOW).len(), 1);
   }

   #[test]
   fn test_new_version_buckets() {
      let (_dir, mut store) = store_with_release(true);
      let mut ok_change = change(0, &[], 2);
      ok_change.build.push(build("hrev2", 1, true, 1));
      store.data.change.insert("I0a".to_string(), ok_change);
      let mut broken_change = change(0, &[], 2);
      broken_change.build.push(build("hrev2", 1, false, 1));
      store.data.change.insert("I0b".to_string(), broken_change);
      // broken-broken lands in bucket 2, plain new version in 4.
      assert_eq!(sorted_changes(&store, NOW), vec!["I0b".to_string(), "I0a".to_string()]);
   }

   #[test]
   fn test_same_version_same_baseline_skipped() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(0, &[], 1);
      built.build.push(build("hrev2", 1, true, 1));
      store.data.change.insert("I0a".to_string(), built);
      assert!(sorted_changes(&store, NOW).is_empty());
   }

   #[test]
   fn test_bucket9_minimum_delay_skips_recent_builds() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(0, &[], 1);
      // Built on the older baseline a few hours ago: below min_delay.
      let mut b = build("hrev1", 1, true, 0);
      b.time = NOW - DAY / 4;
      built.build.push(b);
      built.time.update = NOW - 10 * DAY;
      store.data.change.insert("I0a".to_string(), built);
      assert!(sorted_changes(&store, NOW).is_empty());
   }

   #[test]
   fn test_bucket9_stale_build_queued() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(0, &[], 1);
      built.build.push(build("hrev1", 1, true, 3));
      store.data.change.insert("I0a".to_string(), built);
      assert_eq!(sorted_changes(&store, NOW), vec!["I0a".to_string()]);
   }

   #[test]
   fn test_bucket9_forced_after_a_month() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(-1, &[TAG_WIP, TAG_UNRESOLVED], 1);
      // Weight alone would never clear the inflated min_delay, but ancient
      // builds are forced through.
      built.build.push(build("hrev1", 1, true, 40));
      built.time.version = NOW - 40 * DAY;
      built.time.update = NOW - 40 * DAY;
      store.data.change.insert("I0a".to_string(), built);
      assert_eq!(sorted_changes(&store, NOW), vec!["I0a".to_string()]);
   }

   #[test]
   fn test_queue_is_deterministic_and_tiebreaks_on_cid() {
      let (_dir, mut store) = store_with_release(true);
      for cid in ["I0c", "I0a", "I0b"] {
         store.data.change.insert(cid.to_string(), change(0, &[], 1));
      }
      let queue = sorted_changes(&store, NOW);
      assert_eq!(queue, vec!["I0a".to_string(), "I0b".to_string(), "I0c".to_string()]);
      assert_eq!(queue, sorted_changes(&store, NOW));
   }

   #[test]
   fn test_review_score_orders_within_bucket() {
      let (_dir, mut store) = store_with_release(true);
      store.data.change.insert("I0a".to_string(), change(0, &[], 1));
      store.data.change.insert("I0b".to_string(), change(1, &[], 1));
      assert_eq!(sorted_changes(&store, NOW), vec!["I0b".to_string(), "I0a".to_string()]);
   }

   #[test]
   fn test_remove_old_starved_marks_logs_only() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(0, &[], 3);
      built.build.push(build("hrev1", 1, true, 9));
      built.build.push(build("hrev1", 2, true, 6));
      built.build.push(build("hrev2", 3, true, 1));
      store.data.change.insert("I0a".to_string(), built);
      let paths = test_paths();
      remove_old_starved(&mut store, &paths).unwrap();
      let builds = &store.data.change["I0a"].build;
      assert!(builds[0].logs_only);
      assert!(builds[1].logs_only);
      assert!(!builds[2].logs_only);
   }

   #[test]
   fn test_remove_old_harder_truncates_and_pins_sent_review() {
      let (_dir, mut store) = store_with_release(true);
      let mut built = change(0, &[], 3);
      built.build.push(build("hrev1", 1, true, 9));
      built.build.push(build("hrev2", 2, true, 6));
      built.build.push(build("hrev2", 2, true, 4));
      built.build.push(build("hrev2", 3, true, 1));
      built.sent_review.parent = Some("hrev1".to_string());
      store.data.change.insert("I0a".to_string(), built);

      let config = test_config();
      let paths = test_paths();
      let builder =
         BuildContext::new(config.clone(), paths.clone(), crate::gitutils::GitRepo::new("/nonexistent"));
      remove_old_harder(&mut store, &builder, &paths, &config, NOW).unwrap();
      // The reviewed build survives the truncation to three.
      let builds = &store.data.change["I0a"].build;
      assert_eq!(builds.len(), 4);
      assert_eq!(builds[0].parent, "hrev1");

      // Without the pin it is simply dropped.
      store.data.change.get_mut("I0a").unwrap().sent_review.parent = None;
      remove_old_harder(&mut store, &builder, &paths, &config, NOW).unwrap();
      let builds = &store.data.change["I0a"].build;
      assert_eq!(builds.len(), 3);
      assert_eq!(builds[0].parent, "hrev2");
   }

   fn test_config() -> BotConfig {
      toml::from_str(
         r#"
[builder]
gerrit_url = "u"
project = "p"
branch = "master"
branch_base = "base"
branch_rolling = "rolling"
worktree = "/nonexistent/worktree"
build = "/nonexistent/build"
buildtools = "/nonexistent/buildtools"
jam = "/nonexistent/jam"
www_root = "/nonexistent/www"
link = "/testbuild"
site = "s"
time_limit = 1
low_disk = 1
keep_done = 1.0
keep_done_pressure = 1.0

[arch.x86_64]
target = "@nightly"
"#,
      )
      .unwrap()
   }

   fn test_paths() -> Paths {
      Paths::new(&test_config().builder)
   }
}
