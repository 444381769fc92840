//! List which proposals pin which releases: through kept logs, full build
//! trees, or the last sent review.

use std::collections::BTreeMap;

use anyhow::Result;
use buildbot::config::BotConfig;
use buildbot::paths::Paths;
use buildbot::store::Store;

fn main() -> Result<()> {
   let config = BotConfig::load()?;
   let paths = Paths::new(&config.builder);
   let store = Store::open(paths.www_root())?;

   let mut lockers: BTreeMap<&String, [Vec<&String>; 3]> =
      store.data.release.keys().map(|tag| (tag, Default::default())).collect();
   for (cid, change) in store.data.change.iter().chain(store.data.done.iter()) {
      if let Some(parent) = &change.sent_review.parent {
         if let Some(groups) = lockers.get_mut(parent) {
            groups[2].push(cid);
         }
      }
      for build in &change.build {
         let group = usize::from(!build.logs_only);
         if let Some(groups) = lockers.get_mut(&build.parent) {
            groups[group].push(cid);
         }
      }
   }

   for (tag, groups) in &lockers {
      if Some(*tag) == store.data.current.as_ref() {
         println!("{tag} current");
      }
      for (name, cids) in ["log", "full", "review"].iter().zip(groups) {
         for cid in cids {
            println!("{tag} {name} {cid}");
         }
      }
   }

   Ok(())
}
