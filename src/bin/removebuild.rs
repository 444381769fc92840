//! Drop one build record (and its published tree) from a proposal, or a
//! whole release when no hrev is given. Only safe while the daemon is
//! stopped, so the stop sentinel is required.

use anyhow::{Context, Result, bail};
use clap::Parser;

use buildbot::config::BotConfig;
use buildbot::orchestrator::STOP_FLAG;
use buildbot::paths::{Paths, remove_tree};
use buildbot::store::{BuildRecord, ChangeRecord, Store};

#[derive(Parser)]
#[command(about = "Remove a build from the store and the web tree")]
struct Args {
   /// Change id, or a release tag when no hrev follows
   changeset: String,
   /// Release tag the build to drop was based on
   hrev: Option<String>,
}

fn pop_master(builds: &mut Vec<BuildRecord>, hrev: &str) -> Option<BuildRecord> {
   let pos = builds.iter().position(|build| build.parent == hrev)?;
   Some(builds.remove(pos))
}

fn remove_trees(paths: &Paths, cid: &str, old: &BuildRecord) {
   remove_tree(&paths.www(cid, old.version, &old.parent, None, true));
   if !old.picked.is_empty() {
      remove_tree(&paths.www(cid, old.version, &old.parent, None, false));
   }
}

fn remove_changeset(store: &mut Store, paths: &Paths, cid: &str, hrev: &str) -> Result<()> {
   let change: &mut ChangeRecord = store
      .data
      .change
      .get_mut(cid)
      .or_else(|| store.data.done.get_mut(cid))
      .with_context(|| format!("unknown changeset {cid}"))?;
   let old = pop_master(&mut change.build, hrev).context("unknown build")?;
   remove_trees(paths, cid, &old);
   Ok(())
}

fn remove_master(store: &mut Store, paths: &Paths, branch: &str, hrev: &str) -> Result<()> {
   if !store.data.release.contains_key(hrev) {
      bail!("unknown revision {hrev}");
   }
   if store.data.current.as_deref() == Some(hrev) {
      bail!("{hrev} is the current revision");
   }
   let cids: Vec<String> = store
      .data
      .change
      .keys()
      .chain(store.data.done.keys())
      .cloned()
      .collect();
   for cid in cids {
      let change = store
         .data
         .change
         .get_mut(&cid)
         .or_else(|| store.data.done.get_mut(&cid))
         .unwrap();
      if let Some(old) = pop_master(&mut change.build, hrev) {
         remove_trees(paths, &cid, &old);
      }
   }
   paths.delete_release(branch, hrev);
   store.data.release.remove(hrev);
   Ok(())
}

fn main() -> Result<()> {
   let args = Args::parse();
   if !std::path::Path::new(STOP_FLAG).exists() {
      // No guarantee, but better than nothing.
      bail!("make sure the main process is not running (touch {STOP_FLAG})");
   }

   let config = BotConfig::load()?;
   let paths = Paths::new(&config.builder);
   let mut store = Store::open(paths.www_root())?;

   match &args.hrev {
      None => remove_master(&mut store, &paths, &config.builder.branch, &args.changeset)?,
      Some(hrev) => remove_changeset(&mut store, &paths, &args.changeset, hrev)?,
   }

   store.save()?;
   Ok(())
}
