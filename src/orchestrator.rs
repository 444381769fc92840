//! Single-threaded main loop: at most one build in flight, cooperative
//! shutdown through a filesystem sentinel, disk and wall-clock budgets.

use std::path::Path;

use tracing::{error, info, warn};

use crate::builder::BuildContext;
use crate::chain::ChainSet;
use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::gerrit::{self, GerritBranch, GerritClient};
use crate::gitutils::GitRepo;
use crate::paths::{Paths, free_disk_space};
use crate::review;
use crate::scheduler::{self, SECONDS_PER_DAY};
use crate::store::{Store, now};

pub const STOP_FLAG: &str = "stop.please";

/// A fresh baseline build took a while; give the run time to look at the
/// proposals too.
const RELEASE_TIME_BONUS: i64 = 30 * 60;

/// Grace period before retrying after a transient failure.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(60);

enum Tick {
   Continue,
   Stop,
}

pub struct Orchestrator {
   config: BotConfig,
   paths: Paths,
   store: Store,
   gerrit: GerritBranch,
   chain: ChainSet,
   builder: BuildContext,
}

impl Orchestrator {
   pub fn new(config: BotConfig) -> Result<Self> {
      let paths = Paths::new(&config.builder);
      let store = Store::open(paths.www_root())?;
      let repo = GitRepo::new(config.builder.worktree.clone());
      let client = GerritClient::new(&config.builder.gerrit_url, config.auth())?;
      let remote = client.project_url(&config.builder.project);
      let gerrit = GerritBranch::new(
         client,
         &config.builder.project,
         &config.builder.branch,
         config.builder.gerrit_cache,
      );
      let base = store.data.current.clone().unwrap_or_default();
      let chain = ChainSet::new(repo.clone(), &config.builder.gerrit_url, &remote, &base);
      let builder = BuildContext::new(config.clone(), paths.clone(), repo);
      Ok(Self { config, paths, store, gerrit, chain, builder })
   }

   fn stop_requested() -> bool {
      Path::new(STOP_FLAG).exists()
   }

   /// Mirror the review server's open changes into the store, and note the
   /// current revision of each for ancestor mapping.
   fn refresh_changes(&mut self) -> Result<()> {
      let changes = self.gerrit.get_changes()?.clone();
      for info in changes.values() {
         match gerrit::change_record(info) {
            Ok(record) => {
               self.chain.note_revision(&info.current_revision, &info.change_id);
               self.store.set_change_info(&info.change_id, record);
            }
            Err(err) => warn!(cid = %info.change_id, %err, "skipping change"),
         }
      }
      let gone: Vec<String> = self
         .store
         .data
         .change
         .keys()
         .filter(|cid| !changes.contains_key(*cid))
         .cloned()
         .collect();
      for cid in gone {
         self.store.set_change_done(&cid);
      }
      Ok(())
   }

   fn enforce_disk_budget(&mut self) -> Result<bool> {
      let low_disk = self.config.builder.low_disk;
      if free_disk_space(self.paths.www_root())? >= low_disk {
         return Ok(true);
      }
      scheduler::remove_old_harder(
         &mut self.store,
         &self.builder,
         &self.paths,
         &self.config,
         now(),
      )?;
      if free_disk_space(self.paths.www_root())? >= low_disk {
         return Ok(true);
      }
      scheduler::remove_old_starved(&mut self.store, &self.paths)?;
      if free_disk_space(self.paths.www_root())? >= low_disk {
         return Ok(true);
      }
      error!("web root still out of disk space after cleanup");
      Ok(false)
   }

   fn tick(&mut self, deadline: &mut i64) -> Result<Tick> {
      if self.builder.update_release(&mut self.store)? {
         // The build took our time; look for upstream updates again first.
         *deadline += RELEASE_TIME_BONUS;
         return Ok(Tick::Continue);
      }

      self.refresh_changes()?;
      self.chain.update_changes(&self.store)?;

      let queue = scheduler::sorted_changes(&self.store, now());
      self.store.data.queued.clone_from(&queue);
      let Some(cid) = queue.first().cloned() else {
         return Ok(Tick::Stop);
      };

      info!(%cid, queued = queue.len(), "building top of queue");
      self.builder.build_change(&mut self.store, &mut self.chain, &cid)?;
      self.store.data.queued = queue[1..].to_vec();

      if let Some(info) = self.gerrit.get_change(&cid)?.cloned() {
         review::review(
            &mut self.store,
            &self.paths,
            &self.config,
            self.gerrit.client(),
            &info,
            &cid,
         )?;
      }

      if now() > *deadline {
         info!("time budget exhausted");
         return Ok(Tick::Stop);
      }
      Ok(Tick::Continue)
   }

   pub fn run(&mut self) -> Result<()> {
      self.builder.mrproper()?;
      let mut deadline = now() + self.config.builder.time_limit as i64;

      loop {
         if Self::stop_requested() {
            info!("stop requested");
            break;
         }
         if !self.enforce_disk_budget()? {
            break;
         }
         match self.tick(&mut deadline) {
            Ok(Tick::Continue) => {}
            Ok(Tick::Stop) => break,
            Err(
               err @ (BotError::HttpError(_) | BotError::ApiError { .. } | BotError::GitError(_)),
            ) => {
               // Transient: skip this iteration, retry on the next tick.
               warn!(%err, "iteration failed");
               std::thread::sleep(RETRY_DELAY);
            }
            Err(err) => return Err(err),
         }
      }

      scheduler::remove_done_before(
         &mut self.store,
         &self.builder,
         deadline - (self.config.builder.keep_done * SECONDS_PER_DAY as f64) as i64,
      )?;
      scheduler::remove_unused_releases(&mut self.store, &self.paths, &self.config.builder.branch);
      self.store.save()
   }
}
