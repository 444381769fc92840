//! Verdict composer: turns the latest build of a proposal into a review
//! comment with a ±1 Verified score, suppressing anything that would not
//! tell the reviewers something new.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::error::Result;
use crate::gerrit::{ChangeInfo, GerritClient, ReviewInput};
use crate::log_analysis::FullMap;
use crate::paths::Paths;
use crate::store::{ALL_ARCHES, BuildRecord, ChangeRecord, ResultMap, SentArch, Store};

/// Rough cap on the new-message listing inside one comment.
const LISTING_LIMIT: usize = 1400;

/// Failure classes caused by mirror hiccups, not by the change under test.
const TRANSIENT_MARKERS: &[&str] = &["DownloadLocatedFile", "Connection timed out"];

static RE_OBJECTS: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"objects/haiku/[^/]*/").unwrap());
static RE_DOWNLOAD: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"(download/\S+-)[^-]+\.hpkg").unwrap());

/// Generalize per-arch paths in a failure message and fold duplicate lines,
/// so the same breakage reads identically for every architecture.
fn clean_msg(s: &str) -> String {
   let s = RE_OBJECTS.replace_all(s, "objects/haiku/<arch>/");
   let s = RE_DOWNLOAD.replace_all(&s, "${1}<arch>.hpkg");
   let mut lines: Vec<&str> = s.split('\n').collect();
   if let Some(last) = lines.last() {
      if last.starts_with("...failed updating ") && last.ends_with(" target(s)...") {
         lines.pop();
      }
   }
   let unique: BTreeSet<&str> = lines.into_iter().collect();
   format!("   {}", unique.into_iter().collect::<Vec<_>>().join("\n   "))
}

/// Per-arch view of one build side, messages cleaned for comparison.
fn base_review(result: &ResultMap) -> BTreeMap<String, SentArch> {
   result
      .iter()
      .filter(|(arch, _)| arch.as_str() != ALL_ARCHES)
      .map(|(arch, data)| {
         let msg = if data.ok == Some(true) {
            "OK".to_string()
         } else {
            clean_msg(data.message.as_deref().unwrap_or(""))
         };
         (arch.clone(), SentArch { ok: data.ok, msg })
      })
      .collect()
}

fn is_transient(result: &ResultMap) -> bool {
   result.values().any(|data| {
      data
         .message
         .as_deref()
         .is_some_and(|msg| TRANSIENT_MARKERS.iter().any(|marker| msg.contains(marker)))
   })
}

pub struct Verdict {
   pub message: String,
   pub score: i32,
   pub review: BTreeMap<String, SentArch>,
}

/// Compose the review for the latest build, or None when nothing should be
/// posted. `new_msgs` carries the formatted new-message lines per arch and
/// `report_url` the published results page.
pub fn compose(
   change: &ChangeRecord,
   build: &BuildRecord,
   parent_result: &ResultMap,
   info: &ChangeInfo,
   new_msgs: &BTreeMap<String, Vec<String>>,
   branch: &str,
   report_url: &str,
) -> Option<Verdict> {
   if build.rebased.get(ALL_ARCHES)?.ok != Some(true) {
      // Conflicts (or an already-merged tree): no verdict.
      return None;
   }
   if is_transient(&build.rebased) || is_transient(&build.picked) {
      debug!("transient failure, not posting a review");
      return None;
   }

   let mut current_review = base_review(&build.rebased);
   if !build.picked.is_empty() {
      let picked_review = base_review(&build.picked);
      if picked_review != current_review {
         // The plain cherry-pick disagrees with the rebased build; a single
         // verdict would be misleading.
         return None;
      }
   }

   let rev = info.current_revision_info()?;
   if build.version != rev.number {
      return None;
   }

   // Architectures without a baseline result cannot be judged.
   current_review.retain(|arch, _| parent_result.contains_key(arch));
   if current_review.is_empty() {
      return None;
   }

   let last_review = &change.sent_review;
   let mut all_ok = true;
   let mut same_as_parent = true;
   let mut same_as_last = true;
   for (arch, result) in &mut current_review {
      if result.ok != Some(true) {
         all_ok = false;
      }
      if let Some(last) = last_review.arches.get(arch) {
         if last.ok != result.ok {
            same_as_last = false;
            if result.ok == Some(true) {
               result.msg = "fixed".to_string();
            }
         }
      }
      if let Some(parent) = parent_result.get(arch) {
         if parent.ok != result.ok {
            same_as_parent = false;
            if result.ok == Some(true) {
               result.msg = format!("fixes {branch}");
            }
         }
      }
   }

   // Nothing new to say: same outcome as the last posted review, or an
   // unremarkable failure the baseline shares.
   if last_review.version == i64::from(build.version) && same_as_last {
      return None;
   }
   if !all_ok && same_as_parent {
      return None;
   }

   let score = if all_ok { 1 } else { -1 };
   let implied = if all_ok { "+1" } else { "-1" };
   if info.verified_score() == implied {
      return None;
   }

   let mut message = if all_ok {
      if same_as_parent {
         let mut headline = format!("Build OK rebasing over {}", build.parent);
         if !same_as_last {
            headline.push_str(", fixes previous version");
         }
         headline
      } else {
         format!("Build FIXES {}", build.parent)
      }
   } else {
      format!("FAILED build rebasing over {}", build.parent)
   };
   let arch_names: Vec<&str> = current_review.keys().map(String::as_str).collect();
   message.push_str(&format!(" [{}]", arch_names.join(", ")));

   // New problems every architecture shares go into one "all:" block;
   // per-arch sections keep only their own residue.
   let mut common: Vec<String> = Vec::new();
   if current_review.len() > 1 && current_review.keys().all(|arch| new_msgs.contains_key(arch)) {
      let mut sets = current_review.keys().map(|arch| &new_msgs[arch]);
      if let Some(first) = sets.next() {
         common =
            first.iter().filter(|line| sets.clone().all(|s| s.contains(*line))).cloned().collect();
      }
   }

   let mut listing_budget = LISTING_LIMIT;
   let mut listing_truncated = false;
   let mut push_listing = |message: &mut String, lines: &[String]| {
      for line in lines {
         if listing_truncated {
            return;
         }
         if line.len() + 4 > listing_budget {
            message.push_str("\n   ...");
            listing_truncated = true;
            return;
         }
         listing_budget -= line.len() + 4;
         message.push_str("\n   ");
         message.push_str(line);
      }
   };

   if !common.is_empty() {
      message.push_str("\n\nall:");
      push_listing(&mut message, &common);
   }

   for (arch, result) in &current_review {
      message.push_str(&format!("\n\n{arch}: "));
      if result.ok == Some(true) {
         message.push_str(&result.msg);
         let new_count = new_msgs.get(arch).map_or(0, |lines| lines.len());
         if new_count > 0 {
            message.push_str(&format!(
               " with {new_count} new problem{}",
               if new_count == 1 { "" } else { "s" }
            ));
         }
         if let Some(lines) = new_msgs.get(arch) {
            let residual: Vec<String> =
               lines.iter().filter(|line| !common.contains(*line)).cloned().collect();
            push_listing(&mut message, &residual);
         }
      } else if last_review.arches.get(arch).is_some_and(|last| last.msg == result.msg) {
         message.push_str("still broken");
      } else {
         message.push('\n');
         message.push_str(&result.msg);
      }
   }

   message.push_str(&format!("\n\n{report_url}"));

   Some(Verdict { message, score, review: current_review })
}

/// New-message lines for one architecture of a build, as published by the
/// build pipeline.
fn new_message_lines(paths: &Paths, cid: &str, build: &BuildRecord, arch: &str) -> Vec<String> {
   let path = paths
      .www(cid, build.version, &build.parent, Some(arch), true)
      .join("new-messages.json");
   let Ok(contents) = std::fs::read_to_string(&path) else {
      return Vec::new();
   };
   let map: FullMap = match serde_json::from_str(&contents) {
      Ok(map) => map,
      Err(_) => return Vec::new(),
   };
   let mut lines = Vec::new();
   for (file, items) in &map {
      for (_, src_line, msg) in items {
         if *src_line == 0 {
            lines.push(format!("{file}: {msg}"));
         } else {
            lines.push(format!("{file}:{src_line}: {msg}"));
         }
      }
   }
   lines
}

/// Compose and post the verdict for a proposal's latest build; records the
/// sent review on success. A failed POST is left for the next tick to retry.
pub fn review(
   store: &mut Store,
   paths: &Paths,
   config: &BotConfig,
   client: &GerritClient,
   info: &ChangeInfo,
   cid: &str,
) -> Result<()> {
   if !client.has_auth() {
      return Ok(());
   }
   let Some(change) = store.data.change.get(cid) else {
      return Ok(());
   };
   let Some(build) = change.build.last() else {
      return Ok(());
   };
   let Some(parent_result) =
      store.data.release.get(&build.parent).map(|release| release.result.clone())
   else {
      return Ok(());
   };

   let mut new_msgs = BTreeMap::new();
   for arch in build.rebased.keys().filter(|a| a.as_str() != ALL_ARCHES) {
      new_msgs.insert(arch.clone(), new_message_lines(paths, cid, build, arch));
   }
   let report_url = format!(
      "{}{}",
      config.builder.site,
      paths.www_link(&paths.www(cid, build.version, &build.parent, None, true))
   );

   let Some(verdict) = compose(
      change,
      build,
      &parent_result,
      info,
      &new_msgs,
      &config.builder.branch,
      &report_url,
   ) else {
      return Ok(());
   };

   let (version, parent) = (build.version, build.parent.clone());
   match client.post_review(
      cid,
      &info.current_revision,
      &ReviewInput::new(verdict.message, verdict.score),
   ) {
      Ok(_) => {
         let change = store.data.change.get_mut(cid).unwrap();
         change.sent_review.version = i64::from(version);
         change.sent_review.parent = Some(parent);
         change.sent_review.arches = verdict.review;
         store.save()?;
      }
      Err(err) => {
         // Next tick may retry: sent_review stays as it was.
         warn!(cid, %err, "review POST failed");
      }
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::store::{ArchResult, ChangeTimes, SentReview};

   fn result_map(entries: &[(&str, bool, &str)]) -> ResultMap {
      let mut map: ResultMap = entries
         .iter()
         .map(|(arch, ok, msg)| {
            (arch.to_string(), ArchResult {
               ok: Some(*ok),
               warnings: 0,
               errors: 0,
               message: if msg.is_empty() { None } else { Some(msg.to_string()) },
            })
         })
         .collect();
      map.insert(ALL_ARCHES.to_string(), ArchResult {
         ok: Some(true),
         ..Default::default()
      });
      map
   }

   fn build(parent: &str, version: u32, results: &[(&str, bool, &str)]) -> BuildRecord {
      BuildRecord {
         parent: parent.to_string(),
         version,
         time: 0,
         logs_only: false,
         rebased: result_map(results),
         picked: ResultMap::new(),
      }
   }

   fn change(version: u32) -> ChangeRecord {
      ChangeRecord {
         id: 7000,
         title: "t".to_string(),
         version,
         ref_name: String::new(),
         time: ChangeTimes::default(),
         tags: Default::default(),
         review: 0,
         sent_review: SentReview::default(),
         build: Vec::new(),
         lastbuild: None,
      }
   }

   fn info(version: u32) -> ChangeInfo {
      serde_json::from_value(serde_json::json!({
         "change_id": "I0abc",
         "_number": 7000,
         "subject": "t",
         "status": "NEW",
         "created": "2024-03-01 12:00:00.000000000",
         "updated": "2024-03-01 12:00:00.000000000",
         "current_revision": "deadbeef",
         "revisions": {"deadbeef": {"_number": version, "ref": "r",
            "created": "2024-03-01 12:00:00.000000000"}},
      }))
      .unwrap()
   }

   const URL: &str = "https://site/testbuild/I0abc/1/hrev2";

   #[test]
   fn test_ok_build_scores_plus_one() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).unwrap();
      assert_eq!(verdict.score, 1);
      assert!(verdict.message.starts_with("Build OK rebasing over hrev2 [x86_64]"));
      assert!(verdict.message.ends_with(URL));
   }

   #[test]
   fn test_failed_build_scores_minus_one() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", false, "...failed updating 1 target(s)...")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).unwrap();
      assert_eq!(verdict.score, -1);
      assert!(verdict.message.starts_with("FAILED build rebasing over hrev2 [x86_64]"));
   }

   #[test]
   fn test_conflict_build_is_skipped() {
      let change = change(1);
      let mut build = build("hrev2", 1, &[("x86_64", false, "")]);
      build.rebased.get_mut(ALL_ARCHES).unwrap().ok = Some(false);
      let parent = result_map(&[("x86_64", true, "")]);
      assert!(
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).is_none()
      );
   }

   #[test]
   fn test_version_mismatch_is_skipped() {
      let change = change(2);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      assert!(
         compose(&change, &build, &parent, &info(2), &BTreeMap::new(), "master", URL).is_none()
      );
   }

   #[test]
   fn test_failure_matching_broken_baseline_is_skipped() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", false, "boom")]);
      let parent = result_map(&[("x86_64", false, "boom")]);
      assert!(
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).is_none()
      );
   }

   #[test]
   fn test_fix_of_broken_baseline_reported() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", false, "boom")]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).unwrap();
      assert!(verdict.message.starts_with("Build FIXES hrev2"));
      assert!(verdict.message.contains("x86_64: fixes master"));
   }

   #[test]
   fn test_repeat_of_sent_review_suppressed() {
      let mut change = change(1);
      change.sent_review = SentReview {
         version: 1,
         parent: Some("hrev2".to_string()),
         arches: BTreeMap::from([("x86_64".to_string(), SentArch {
            ok: Some(true),
            msg: "OK".to_string(),
         })]),
      };
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      assert!(
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).is_none()
      );
   }

   #[test]
   fn test_matching_verified_label_suppressed() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let mut info = info(1);
      info.labels.insert("Verified".to_string(), crate::gerrit::LabelInfo {
         approved: Some(serde_json::json!({})),
         ..Default::default()
      });
      assert!(compose(&change, &build, &parent, &info, &BTreeMap::new(), "master", URL).is_none());
   }

   #[test]
   fn test_transient_failure_not_reported() {
      let change = change(1);
      let build = build("hrev2", 1, &[(
         "x86_64",
         false,
         "DownloadLocatedFile: mirror went away",
      )]);
      let parent = result_map(&[("x86_64", true, "")]);
      assert!(
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).is_none()
      );
   }

   #[test]
   fn test_arch_without_baseline_dropped() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, ""), ("riscv64", false, "boom")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &BTreeMap::new(), "master", URL).unwrap();
      // riscv64 has no baseline: ignored, the build counts as OK.
      assert_eq!(verdict.score, 1);
      assert!(!verdict.message.contains("riscv64"));
   }

   #[test]
   fn test_new_problems_mentioned_and_listed() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let new_msgs = BTreeMap::from([(
         "x86_64".to_string(),
         vec!["foo.cpp:10: unused variable 'x'".to_string(), "foo.cpp:20: bad cast".to_string()],
      )]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &new_msgs, "master", URL).unwrap();
      assert!(verdict.message.contains("x86_64: OK with 2 new problems"));
      assert!(verdict.message.contains("foo.cpp:10: unused variable 'x'"));
   }

   #[test]
   fn test_common_new_messages_factored_into_all_section() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, ""), ("x86_gcc2h", true, "")]);
      let parent = result_map(&[("x86_64", true, ""), ("x86_gcc2h", true, "")]);
      let new_msgs = BTreeMap::from([
         (
            "x86_64".to_string(),
            vec!["shared.cpp:1: overflow".to_string(), "only64.cpp:2: oops".to_string()],
         ),
         ("x86_gcc2h".to_string(), vec!["shared.cpp:1: overflow".to_string()]),
      ]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &new_msgs, "master", URL).unwrap();
      let all_pos = verdict.message.find("all:").unwrap();
      let shared_pos = verdict.message.find("shared.cpp:1: overflow").unwrap();
      assert!(shared_pos > all_pos);
      // The shared line appears exactly once, in the all: section.
      assert_eq!(verdict.message.matches("shared.cpp:1: overflow").count(), 1);
      assert!(verdict.message.contains("only64.cpp:2: oops"));
   }

   #[test]
   fn test_listing_is_capped() {
      let change = change(1);
      let build = build("hrev2", 1, &[("x86_64", true, "")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let lines: Vec<String> =
         (0..200).map(|i| format!("file{i}.cpp:1: some long warning message here")).collect();
      let new_msgs = BTreeMap::from([("x86_64".to_string(), lines)]);
      let verdict =
         compose(&change, &build, &parent, &info(1), &new_msgs, "master", URL).unwrap();
      assert!(verdict.message.contains("..."));
      // Headline, status and URL survive; the listing stays within budget.
      assert!(verdict.message.len() < LISTING_LIMIT + 500);
      assert!(verdict.message.ends_with(URL));
   }

   #[test]
   fn test_clean_msg_folds_arch_specific_paths() {
      let cleaned = clean_msg(
         "objects/haiku/x86_64/packaging/foo failed\n\
          objects/haiku/x86_gcc2h/packaging/foo failed\n\
          ...failed updating 2 target(s)...",
      );
      assert_eq!(cleaned, "   objects/haiku/<arch>/packaging/foo failed");
   }

   #[test]
   fn test_still_broken_when_message_matches_last_review() {
      let mut change = change(2);
      change.sent_review = SentReview {
         version: 1,
         parent: Some("hrev1".to_string()),
         arches: BTreeMap::from([("x86_64".to_string(), SentArch {
            ok: Some(false),
            msg: "   boom".to_string(),
         })]),
      };
      let build = build("hrev2", 2, &[("x86_64", false, "boom")]);
      let parent = result_map(&[("x86_64", true, "")]);
      let verdict =
         compose(&change, &build, &parent, &info(2), &BTreeMap::new(), "master", URL).unwrap();
      assert!(verdict.message.contains("x86_64: still broken"));
   }
}
