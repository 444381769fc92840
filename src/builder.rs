//! Build driver: configures the workspace, runs jam for each architecture,
//! post-processes the log through the analyzer and publishes results under
//! the web root.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::archive;
use crate::buildtools;
use crate::chain::{ChainSet, changeset_branch_name};
use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::gitutils::GitRepo;
use crate::jam;
use crate::log_analysis::{self, Analysis, FullMap, PathTransformer};
use crate::paths::{Paths, relative_path, remove_tree};
use crate::render::{FileLinker, LogPage};
use crate::store::{ALL_ARCHES, ArchResult, ResultMap, Store, now};

/// Owns the build configuration and the per-run caches the pipeline needs
/// (the baseline message cache in particular).
pub struct BuildContext {
   config: BotConfig,
   paths: Paths,
   repo: GitRepo,
   master_msgs_tag: Option<String>,
   master_msgs: HashMap<String, Option<FullMap>>,
}

impl BuildContext {
   pub fn new(config: BotConfig, paths: Paths, repo: GitRepo) -> Self {
      Self {
         config,
         paths,
         repo,
         master_msgs_tag: None,
         master_msgs: HashMap::new(),
      }
   }

   pub fn paths(&self) -> &Paths {
      &self.paths
   }

   pub fn repo(&self) -> &GitRepo {
      &self.repo
   }

   /// Recover from whatever state a crashed run left the repository in and
   /// park the rolling branch on the base.
   pub fn mrproper(&self) -> Result<()> {
      if self.repo.currently_replaying()?.is_some() {
         if !self.repo.rebase_abort()? {
            // barf if this one also fails
            self.repo.cherry_pick_abort().map_err(|_| {
               BotError::ReplayState(self.repo.dir().display().to_string())
            })?;
         }
      }
      let base = self.base_commit()?;
      self.repo.reset_branch_hard(&self.config.builder.branch_rolling, &base)
   }

   fn base_commit(&self) -> Result<String> {
      self.repo.branch_commit(&self.config.builder.branch_base)?.ok_or_else(|| {
         BotError::BuildError(format!("branch {} does not exist", self.config.builder.branch_base))
      })
   }

   fn remove_emulated_attributes(&self) {
      remove_tree(&self.paths.emulated_attributes());
   }

   fn configure_build(&self, wd: &Path, arch: &str) -> Result<()> {
      let mut cmd = Command::new(self.paths.worktree().join("configure"));
      // '--use-gcc-graphite' spits spurious maybe-uninitialized errors
      cmd.arg("--use-gcc-pipe").arg("--include-sources");
      for prefix in buildtools::arch_prefixes(&self.paths, arch)? {
         cmd.arg("--cross-tools-prefix").arg(prefix);
      }
      self.run_configure(cmd, wd)
   }

   fn configure_build_update(&self, wd: &Path) -> Result<()> {
      let mut cmd = Command::new(self.paths.worktree().join("configure"));
      cmd.arg("--update");
      self.run_configure(cmd, wd)
   }

   fn run_configure(&self, mut cmd: Command, wd: &Path) -> Result<()> {
      let log = std::fs::File::create(wd.join("configure.log"))?;
      let err = log.try_clone()?;
      cmd.stdout(log).stderr(err).current_dir(wd);
      jam::set_pwd_env(&mut cmd, wd);
      let status = cmd
         .status()
         .map_err(|e| BotError::BuildError(format!("failed to run configure: {e}")))?;
      if !status.success() {
         return Err(BotError::BuildError(format!("configure failed in {}", wd.display())));
      }
      Ok(())
   }

   /// Build one architecture at the checked-out revision. Returns whether jam
   /// exited cleanly plus the path-transformed log.
   pub fn build(&self, arch: &str, tag: &str) -> Result<(bool, Vec<String>)> {
      self.remove_emulated_attributes();
      let path = self.paths.build(arch);
      std::fs::create_dir_all(&path)?;
      self.paths.clean_up(&path);

      if path.join("build").join("BuildConfig").exists() {
         self.configure_build_update(&path)?;
      } else {
         self.configure_build(&path, arch)?;
      }

      let mut options = vec![
         format!("-sHAIKU_REVISION={tag}"),
         format!(
            "-sHAIKU_BUILD_ATTRIBUTES_DIR={}",
            self.paths.emulated_attributes().display()
         ),
      ];
      let arch_config = &self.config.arch[arch];
      options.extend(arch_config.jam_options());

      let log_path = path.join("build.out");
      info!(arch, tag, "building");
      let ok = jam::jam(
         &path,
         &arch_config.target,
         &options,
         self.config.builder.max_jobs,
         self.paths.jam(),
         &log_path,
      )?;
      self.remove_emulated_attributes();

      let raw = std::fs::read(&log_path)?;
      let mut log: Vec<String> =
         String::from_utf8_lossy(&raw).split('\n').map(str::to_string).collect();
      PathTransformer::new(&self.paths).transform(&mut log);
      Ok((ok, log))
   }

   /// Baseline `full` message map for one architecture of a release,
   /// amortized across every build of the same run.
   fn master_messages(&mut self, tag: &str, arch: &str) -> Option<FullMap> {
      if self.master_msgs_tag.as_deref() != Some(tag) {
         self.master_msgs_tag = Some(tag.to_string());
         self.master_msgs.clear();
      }
      if let Some(cached) = self.master_msgs.get(arch) {
         return cached.clone();
      }
      let path = self
         .paths
         .www_release(&self.config.builder.branch, tag, Some(arch))
         .join("build-messages.json");
      let loaded = std::fs::read_to_string(&path)
         .ok()
         .and_then(|contents| serde_json::from_str(&contents).ok());
      self.master_msgs.insert(arch.to_string(), loaded.clone());
      loaded
   }

   /// Analysis and publication of one finished build: counts into the
   /// result record, new-message delta against the baseline, the annotated
   /// HTML log, artifact collection, and the JSON result files.
   #[allow(clippy::too_many_arguments)]
   fn process_build(
      &mut self,
      src: &Path,
      dst: &Path,
      log: &[String],
      title: &str,
      linker: &FileLinker,
      parent: Option<&str>,
      parent_result: Option<&ResultMap>,
      result: &mut ResultMap,
      arch: &str,
   ) -> Result<()> {
      let analysis = log_analysis::analyse(log);
      let arch_data = result.entry(arch.to_string()).or_default();
      arch_data.message = Some(analysis.failures.clone());
      arch_data.warnings = analysis.warning_count();
      arch_data.errors = analysis.error_count();
      let warnings = arch_data.warnings;
      let errors = arch_data.errors;

      let mut new_msgs: Option<FullMap> = None;
      let mut deltas = None;
      if let Some(parent) = parent {
         if let Some(old_msgs) = self.master_messages(parent, arch) {
            let (_, added) = log_analysis::diff(&old_msgs, &analysis.full);
            if !added.is_empty() {
               std::fs::write(dst.join("new-messages.json"), serde_json::to_string(&added)?)?;
               new_msgs = Some(added);
            }
         }
         if let Some(parent_arch) = parent_result.and_then(|r| r.get(arch)) {
            deltas = Some((
               i64::from(warnings) - i64::from(parent_arch.warnings),
               i64::from(errors) - i64::from(parent_arch.errors),
               parent,
            ));
         }
      }

      let page = LogPage {
         title,
         css: format!("{}/css/log.css", self.paths.link_root()),
         warnings,
         errors,
         deltas,
         failures: &analysis.failures,
         new_messages: new_msgs.as_ref(),
         error_index: &analysis.errors,
         message_table: analysis.message_table(),
         linker,
      };
      page.write(&dst.join("buildlog.html"), log, &line_classes(&analysis))?;

      if self.config.arch[arch].save_artifacts {
         self.collect_artifacts(src, dst, &analysis);
      }

      std::fs::write(dst.join("build-messages.json"), serde_json::to_string(&analysis.full)?)?;
      std::fs::write(
         dst.join("build-result.json"),
         serde_json::to_string(&result_json(&analysis))?,
      )?;
      Ok(())
   }

   /// Move built packages (and boot images) into the published directory.
   fn collect_artifacts(&self, src: &Path, dst: &Path, analysis: &Analysis) {
      let mut pkgs = analysis.packages.clone();
      let obj_dir = src.join("objects").join("haiku");
      if let Ok(entries) = std::fs::read_dir(&obj_dir) {
         for entry in entries.flatten() {
            if !entry.path().is_dir() {
               continue;
            }
            let pkg_dir = entry.path().join("packaging").join("packages");
            let Ok(packages) = std::fs::read_dir(&pkg_dir) else {
               continue;
            };
            for package in packages.flatten() {
               let name = package.file_name().to_string_lossy().into_owned();
               if let Err(err) = move_file(&package.path(), &dst.join(&name)) {
                  warn!(%err, %name, "cannot move package");
                  continue;
               }
               if !pkgs.remove(&name) {
                  warn!(%name, dir = %pkg_dir.display(), "unexpected package");
               }
            }
         }
      }
      for pkg in pkgs {
         warn!(%pkg, "package not found");
      }

      // gcc2h has no efi.map and esp.image
      for name in ["esp.image", "haiku-nightly-anyboot.iso", "haiku-mmc.image"] {
         let file = src.join(name);
         if !file.exists() {
            continue;
         }
         let _ = std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644));
         if let Err(err) = move_file(&file, &dst.join(name)) {
            warn!(%err, name, "cannot move image");
         }
      }
   }

   fn fill_empty_results(&self) -> ResultMap {
      let mut map: ResultMap = self
         .config
         .arch_names()
         .map(|arch| (arch.to_string(), ArchResult::default()))
         .collect();
      map.insert(ALL_ARCHES.to_string(), ArchResult::default());
      map
   }

   /// Fetch the upstream tip; when it moved (or the last release is
   /// incomplete) rebuild the baseline. Returns whether a build ran.
   pub fn update_release(&mut self, store: &mut Store) -> Result<bool> {
      let commit = self.repo.fetch_tracking(&self.config.builder.branch_base)?;
      let needed = match &store.data.current {
         None => true,
         Some(tag) => store.data.release.get(tag).is_none_or(|release| {
            release.commit != commit || release.result.values().any(|a| a.ok.is_none())
         }),
      };
      if !needed {
         return Ok(false);
      }
      self.repo.force_branch(&self.config.builder.branch_base, &commit)?;
      self.build_release(store)?;
      Ok(true)
   }

   /// Build the tip of the base branch for every architecture that does not
   /// have a result yet.
   pub fn build_release(&mut self, store: &mut Store) -> Result<()> {
      let branch = self.config.builder.branch.clone();
      let commit = self.base_commit()?;
      self.repo.reset_branch_hard(&self.config.builder.branch_rolling, &commit)?;

      let tag = match self.repo.describe_exact(&commit)? {
         Some(tag) => tag,
         None => {
            // Shouldn't happen? Make the synthetic tag resolvable as a
            // commitish without confusing describe for later commits.
            let tag = self.repo.describe_long(&commit)?.replace('-', "+");
            if self.repo.branch_commit(&tag)?.is_none() {
               self.repo.create_branch(&tag, &commit)?;
            }
            tag
         }
      };

      let dst = self.paths.www_release(&branch, &tag, None);
      std::fs::create_dir_all(&dst)?;

      let old_tag = store.data.current.clone();
      if old_tag.as_deref() != Some(tag.as_str()) {
         let mut result = self.fill_empty_results();
         result.insert(ALL_ARCHES.to_string(), ArchResult {
            ok: Some(true),
            ..Default::default()
         });
         store.data.release.insert(tag.clone(), crate::store::ReleaseRecord {
            commit: commit.clone(),
            title: self.repo.commit_summary(&commit)?,
            parent: old_tag,
            time: now(),
            result,
         });
         store.data.current = Some(tag.clone());
         store.save()?;
      }
      // else: error in a previous pass with the same revision; keep what was
      // built.

      if self.config.builder.archive_src && !archive::has_archive(&dst) {
         archive::archive(&dst, self.paths.worktree(), &branch, &tag, "", true)?;
      }

      let parent = store.data.release[&tag].parent.clone();
      let parent_result =
         parent.as_ref().and_then(|p| store.data.release.get(p)).map(|r| r.result.clone());
      let arches: Vec<String> = self.config.arch_names().map(str::to_string).collect();
      for arch in arches {
         if store.data.release[&tag].result[&arch].ok.is_some() {
            continue;
         }
         let (ok, log) = self.build(&arch, &tag)?;
         let src = self.paths.build(&arch);
         let build_dst = self.paths.www_release(&branch, &tag, Some(&arch));
         std::fs::create_dir_all(&build_dst)?;
         let mut result = store.data.release[&tag].result.clone();
         result.get_mut(&arch).unwrap().ok = Some(ok);
         let linker = FileLinker::Release { commit: commit.clone() };
         self.process_build(
            &src,
            &build_dst,
            &log,
            &format!("{branch}: {tag} [{arch}]"),
            &linker,
            parent.as_deref(),
            parent_result.as_ref(),
            &mut result,
            &arch,
         )?;
         store.data.release.get_mut(&tag).unwrap().result = result;
         store.save()?;
      }
      Ok(())
   }

   /// Build the latest version of a proposal: the rebased side first, then
   /// the plain cherry-pick when it differs.
   pub fn build_change(
      &mut self,
      store: &mut Store,
      chain: &mut ChainSet,
      cid: &str,
   ) -> Result<()> {
      let parent = store
         .data
         .current
         .clone()
         .ok_or_else(|| BotError::Other("no current release".to_string()))?;
      let (version, number) = {
         let change = store
            .data
            .change
            .get(cid)
            .ok_or_else(|| BotError::Other(format!("unknown change {cid}")))?;
         (change.version, change.id)
      };
      let build = crate::store::BuildRecord {
         parent: parent.clone(),
         version,
         time: now(),
         logs_only: false,
         rebased: self.fill_empty_results(),
         picked: ResultMap::new(),
      };
      store.data.change.get_mut(cid).unwrap().build.push(build);

      let (rebased, conflicts, conflicting) = chain.rebase(cid)?;
      self.build_side(
         store,
         cid,
         number,
         &parent,
         rebased.as_deref(),
         &conflicts,
         conflicting.as_deref(),
         false,
      )?;

      let (picked, pick_conflicts) = chain.pick(cid)?;
      if rebased.is_some() && picked == rebased {
         return Ok(());
      }
      {
         let change = store.data.change.get_mut(cid).unwrap();
         change.build.last_mut().unwrap().picked = self.fill_empty_results();
      }
      self.build_side(store, cid, number, &parent, picked.as_deref(), &pick_conflicts, None, true)
   }

   /// One side (rebased or picked) of a proposal build: record the composite
   /// outcome, and when there is something to build, run it.
   #[allow(clippy::too_many_arguments)]
   fn build_side(
      &mut self,
      store: &mut Store,
      cid: &str,
      number: u64,
      parent: &str,
      commit: Option<&str>,
      conflicts: &[String],
      conflict_origin: Option<&str>,
      cherry: bool,
   ) -> Result<()> {
      let message = if let Some(commit) = commit {
         if self.repo.commit_tree(parent)? == self.repo.commit_tree(commit)? {
            Some("Already merged".to_string())
         } else {
            None
         }
      } else if !conflicts.is_empty() {
         Some(format!("Conflicts in:\n{}", conflicts.join("\n")))
      } else {
         Some(format!("Conflicts in ancestor {}", conflict_origin.unwrap_or("(unknown)")))
      };

      {
         let change = store.data.change.get_mut(cid).unwrap();
         let build = change.build.last_mut().unwrap();
         let side = if cherry { &mut build.picked } else { &mut build.rebased };
         let overall = side.entry(ALL_ARCHES.to_string()).or_default();
         if let Some(message) = &message {
            overall.ok = Some(false);
            overall.message = Some(message.clone());
         } else {
            overall.ok = Some(true);
         }
      }
      store.save()?;

      if message.is_none() {
         self.run_change_build(store, cid, number, parent, commit.unwrap(), cherry)?;
      }
      Ok(())
   }

   fn run_change_build(
      &mut self,
      store: &mut Store,
      cid: &str,
      number: u64,
      parent: &str,
      commit: &str,
      cherry: bool,
   ) -> Result<()> {
      let version = store.data.change[cid].version;
      let dst = self.paths.www(cid, version, parent, None, !cherry);
      let patches_dir = dst.join("patches");
      std::fs::create_dir_all(&patches_dir)?;

      let release_dir = self.paths.www_release(&self.config.builder.branch, parent, None);
      let baseline = dst.join("baseline");
      if std::fs::symlink_metadata(&baseline).is_err() {
         std::os::unix::fs::symlink(relative_path(&dst, &release_dir), &baseline)?;
      }
      self.repo.format_patch(&format!("{parent}..{commit}"), &patches_dir)?;

      let rolling = self.config.builder.branch_rolling.clone();
      self.repo.reset_branch_hard(&rolling, commit)?;
      let outcome = self.build_change_arches(store, cid, number, parent, cherry);

      // Park the rolling branch back on the base whatever happened.
      let base = self.base_commit()?;
      self.repo.reset_branch_hard(&rolling, &base)?;
      outcome
   }

   fn build_change_arches(
      &mut self,
      store: &mut Store,
      cid: &str,
      number: u64,
      parent: &str,
      cherry: bool,
   ) -> Result<()> {
      let version = store.data.change[cid].version;
      let tag = change_build_tag(parent, number, version, cherry);
      let parent_result = store.data.release.get(parent).map(|r| r.result.clone());
      let arches: Vec<String> = self.config.arch_names().map(str::to_string).collect();
      for arch in arches {
         {
            let build = store.data.change[cid].build.last().unwrap();
            let side = if cherry { &build.picked } else { &build.rebased };
            if side.get(&arch).and_then(|a| a.ok).is_some() {
               continue;
            }
         }
         let (ok, log) = self.build(&arch, &tag)?;
         let src = self.paths.build(&arch);
         let build_dst = self.paths.www(cid, version, parent, Some(&arch), !cherry);
         std::fs::create_dir_all(&build_dst)?;

         let mut result = {
            let build = store.data.change[cid].build.last().unwrap();
            if cherry { build.picked.clone() } else { build.rebased.clone() }
         };
         result.get_mut(&arch).unwrap().ok = Some(ok);
         let linker = FileLinker::Change {
            gerrit_url: self.config.builder.gerrit_url.clone(),
            project: self.config.builder.project.clone(),
            number,
            version,
         };
         self.process_build(
            &src,
            &build_dst,
            &log,
            &format!("{cid} v{version} on {parent} [{arch}]"),
            &linker,
            Some(parent),
            parent_result.as_ref(),
            &mut result,
            &arch,
         )?;
         {
            let change = store.data.change.get_mut(cid).unwrap();
            let build = change.build.last_mut().unwrap();
            if cherry {
               build.picked = result;
            } else {
               build.rebased = result;
            }
         }
         store.save()?;
      }
      Ok(())
   }

   /// Forget finished proposals entirely: store record, published tree and
   /// all bookkeeping branches.
   pub fn remove_done_changes(&self, store: &mut Store, cids: &[String]) -> Result<()> {
      for cid in cids {
         store.data.done.remove(cid);
         self.paths.delete_change(cid);
         let prefix = changeset_branch_name(cid, "");
         let remove: Vec<String> = self
            .repo
            .list_branches()?
            .into_iter()
            .filter(|branch| branch.starts_with(&prefix))
            .collect();
         if !remove.is_empty() {
            debug!(%cid, count = remove.len(), "pruning changeset branches");
            self.repo.delete_branches(&remove)?;
         }
      }
      Ok(())
   }
}

/// Per-log-line css class vector (1-based): 1 warning, 2 error.
pub fn line_classes(analysis: &Analysis) -> Vec<u8> {
   let max_line = analysis
      .warnings
      .values()
      .chain(analysis.errors.values())
      .flatten()
      .map(|item| item.0)
      .max()
      .unwrap_or(0) as usize;
   let mut classes = vec![0u8; max_line + 1];
   for item in analysis.warnings.values().flatten() {
      classes[item.0 as usize] = 1;
   }
   for item in analysis.errors.values().flatten() {
      classes[item.0 as usize] = 2;
   }
   classes
}

/// The published `build-result.json`: everything except the raw `full` map,
/// message ids resolved through an id-indexed table, items tagged with the
/// index of the log file they refer to.
pub fn result_json(analysis: &Analysis) -> serde_json::Value {
   let remap = |items: &std::collections::BTreeMap<String, Vec<crate::log_analysis::MsgItem>>| {
      items
         .iter()
         .map(|(file, msgs)| {
            let msgs: Vec<(u32, u32, u32, usize)> =
               msgs.iter().map(|(log, src, id)| (0, *log, *src, *id)).collect();
            (file.clone(), msgs)
         })
         .collect::<std::collections::BTreeMap<_, _>>()
   };
   serde_json::json!({
      "packages": analysis.packages,
      "failures": analysis.failures,
      "messages": analysis.message_table(),
      "warnings": remap(&analysis.warnings),
      "errors": remap(&analysis.errors),
      "files": ["buildlog.html"],
   })
}

/// Rename, falling back to copy+unlink across filesystems.
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
   match std::fs::rename(src, dst) {
      Ok(()) => Ok(()),
      Err(_) => {
         std::fs::copy(src, dst)?;
         std::fs::remove_file(src)
      }
   }
}

/// Tag a build of a change the way the published tree names it.
pub fn change_build_tag(parent: &str, number: u64, version: u32, cherry: bool) -> String {
   let mut tag = format!("{parent}_{number}_{version}");
   if cherry {
      tag.push_str("_sep");
   }
   tag
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::log_analysis::analyse;

   #[test]
   fn test_line_classes() {
      let log: Vec<String> = vec![
         "/s/a.c:1:1: warning: unused variable 'v' [-Wunused-variable]".to_string(),
         "plain line".to_string(),
         "/s/a.c:2:1: error: expected ';' here".to_string(),
      ];
      let analysis = analyse(&log);
      let classes = line_classes(&analysis);
      assert_eq!(classes, vec![0, 1, 0, 2]);
   }

   #[test]
   fn test_result_json_shape() {
      let log: Vec<String> =
         vec!["/s/a.c:1:1: warning: unused variable 'v' [-Wunused-variable]".to_string()];
      let analysis = analyse(&log);
      let value = result_json(&analysis);
      assert_eq!(value["files"][0], "buildlog.html");
      assert_eq!(value["messages"][0], "unused-variable");
      assert_eq!(value["warnings"]["a.c"][0], serde_json::json!([0, 1, 1, 0]));
      assert!(value.get("full").is_none());
   }

   #[test]
   fn test_change_build_tag() {
      assert_eq!(change_build_tag("hrev57000", 7000, 3, false), "hrev57000_7000_3");
      assert_eq!(change_build_tag("hrev57000", 7000, 3, true), "hrev57000_7000_3_sep");
   }
}
