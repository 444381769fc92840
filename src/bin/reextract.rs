//! Regenerate `build-result.json` and the annotated HTML logs from the
//! published logs themselves. Useful after analyzer changes: the raw log is
//! recovered from the log markup, re-analyzed and re-rendered in place.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Result, bail};

use buildbot::builder::{line_classes, result_json};
use buildbot::config::BotConfig;
use buildbot::log_analysis::analyse;
use buildbot::orchestrator::STOP_FLAG;
use buildbot::paths::Paths;
use buildbot::render::{FileLinker, LogPage, strip_html};
use buildbot::store::{ALL_ARCHES, ResultMap, Store};

/// Raw log lines out of a published `buildlog.html`.
fn recover_log(path: &Path) -> Result<Vec<String>> {
   let contents = std::fs::read_to_string(path)?;
   Ok(contents
      .lines()
      .filter(|line| line.starts_with("<li>"))
      .map(strip_html)
      .collect())
}

/// Interned message texts containing spaces are almost always verbatim
/// messages the classifier failed to key; counting them shows whether a
/// reextract run improved anything.
fn extract_bad(path: &Path, bad: &mut BTreeSet<String>) {
   let Ok(contents) = std::fs::read_to_string(path) else {
      return;
   };
   let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
      return;
   };
   if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
      for message in messages.iter().filter_map(|m| m.as_str()) {
         if message.contains(' ') {
            bad.insert(message.to_string());
         }
      }
   }
}

struct Reextractor {
   css: String,
   bad_before: BTreeSet<String>,
   bad_after: BTreeSet<String>,
}

impl Reextractor {
   /// Re-analyze every architecture directory of one build, rewriting the
   /// log page, the result JSON, and the counts in `result`.
   fn process(
      &mut self,
      base: &Path,
      result: &mut ResultMap,
      parent_result: Option<&ResultMap>,
      parent_tag: Option<&str>,
      title: &str,
      linker: &FileLinker,
   ) -> Result<()> {
      println!("{}", base.display());
      let arches: Vec<String> =
         result.keys().filter(|a| a.as_str() != ALL_ARCHES).cloned().collect();
      for arch in arches {
         let dir = base.join(&arch);
         let result_file = dir.join("build-result.json");
         if !result_file.exists() {
            if !base.join("conflicts.html").exists() {
               println!("No results {}", dir.display());
            }
            continue;
         }
         let log_file = dir.join("buildlog.html");
         if !log_file.exists() {
            continue;
         }
         extract_bad(&result_file, &mut self.bad_before);

         let log = recover_log(&log_file)?;
         let analysis = analyse(&log);
         let arch_data = result.get_mut(&arch).unwrap();
         arch_data.message = Some(analysis.failures.clone());
         arch_data.warnings = analysis.warning_count();
         arch_data.errors = analysis.error_count();

         let deltas = parent_tag.and_then(|tag| {
            parent_result.and_then(|r| r.get(&arch)).map(|parent_arch| {
               (
                  i64::from(arch_data.warnings) - i64::from(parent_arch.warnings),
                  i64::from(arch_data.errors) - i64::from(parent_arch.errors),
                  tag,
               )
            })
         });
         let page_title = format!("{title} [{arch}]");
         let page = LogPage {
            title: &page_title,
            css: self.css.clone(),
            warnings: arch_data.warnings,
            errors: arch_data.errors,
            deltas,
            failures: &analysis.failures,
            new_messages: None,
            error_index: &analysis.errors,
            message_table: analysis.message_table(),
            linker,
         };
         page.write(&log_file, &log, &line_classes(&analysis))?;
         std::fs::write(&result_file, serde_json::to_string(&result_json(&analysis))?)?;

         extract_bad(&result_file, &mut self.bad_after);
      }
      Ok(())
   }
}

fn main() -> Result<()> {
   if !Path::new(STOP_FLAG).exists() {
      // No guarantee, but better than nothing.
      bail!("make sure the main process is not running (touch {STOP_FLAG})");
   }

   let config = BotConfig::load()?;
   let paths = Paths::new(&config.builder);
   let mut store = Store::open(paths.www_root())?;
   let branch = config.builder.branch.clone();
   let mut reextractor = Reextractor {
      css: format!("{}/css/log.css", paths.link_root()),
      bad_before: BTreeSet::new(),
      bad_after: BTreeSet::new(),
   };

   let mut tags: Vec<String> = store.data.release.keys().cloned().collect();
   tags.sort_by_key(|tag| store.data.release[tag].time);
   for tag in tags {
      let release = store.data.release[&tag].clone();
      let parent = release.parent.as_ref().and_then(|p| store.data.release.get(p));
      let parent_result = parent.map(|r| r.result.clone());
      let mut result = release.result.clone();
      reextractor.process(
         &paths.www_release(&branch, &tag, None),
         &mut result,
         parent_result.as_ref(),
         release.parent.as_deref(),
         &format!("{branch}: {tag}"),
         &FileLinker::Release { commit: release.commit.clone() },
      )?;
      store.data.release.get_mut(&tag).unwrap().result = result;
   }

   for done in [false, true] {
      let cids: Vec<String> = if done {
         store.data.done.keys().cloned().collect()
      } else {
         store.data.change.keys().cloned().collect()
      };
      for cid in cids {
         let group = if done { &store.data.done } else { &store.data.change };
         let change = group[&cid].clone();
         for (index, build) in change.build.iter().enumerate() {
            let parent_result =
               store.data.release.get(&build.parent).map(|r| r.result.clone());
            let title = format!("{cid} v{} on {}", build.version, build.parent);
            let linker = FileLinker::Change {
               gerrit_url: config.builder.gerrit_url.clone(),
               project: config.builder.project.clone(),
               number: change.id,
               version: build.version,
            };
            for (full, side_empty) in
               [(true, false), (false, build.picked.is_empty())]
            {
               if side_empty {
                  continue;
               }
               let mut result =
                  if full { build.rebased.clone() } else { build.picked.clone() };
               reextractor.process(
                  &paths.www(&cid, build.version, &build.parent, None, full),
                  &mut result,
                  parent_result.as_ref(),
                  Some(build.parent.as_str()),
                  &title,
                  &linker,
               )?;
               let group = if done { &mut store.data.done } else { &mut store.data.change };
               let target = group.get_mut(&cid).unwrap().build.get_mut(index).unwrap();
               if full {
                  target.rebased = result;
               } else {
                  target.picked = result;
               }
            }
         }
      }
   }

   store.save()?;

   println!("{} -> {}", reextractor.bad_before.len(), reextractor.bad_after.len());
   let removed: Vec<&String> =
      reextractor.bad_before.difference(&reextractor.bad_after).collect();
   let fresh: Vec<&String> =
      reextractor.bad_after.difference(&reextractor.bad_before).collect();
   println!("REMOVED {removed:?}");
   println!("NEW {fresh:?}");

   Ok(())
}
