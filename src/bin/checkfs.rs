//! Reconcile the persistent store against the published filesystem tree,
//! reporting records without files and files without records.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use buildbot::config::BotConfig;
use buildbot::paths::Paths;
use buildbot::store::Store;

fn dir_names(path: &Path) -> BTreeSet<String> {
   std::fs::read_dir(path)
      .map(|entries| {
         entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
      })
      .unwrap_or_default()
}

fn main() -> Result<()> {
   let config = BotConfig::load()?;
   let paths = Paths::new(&config.builder);
   let store = Store::open(paths.www_root())?;
   let branch = &config.builder.branch;

   let db_master: BTreeSet<String> = store.data.release.keys().cloned().collect();
   let f_master = dir_names(&paths.www_root().join("release").join(branch));
   for tag in db_master.difference(&f_master) {
      println!("Ref with no file:  {tag}");
   }
   for tag in f_master.difference(&db_master) {
      println!("File with no ref:  {tag}");
   }
   let known_masters: BTreeSet<&String> = db_master.intersection(&f_master).collect();

   let mut db_cid: BTreeSet<String> = store.data.change.keys().cloned().collect();
   db_cid.extend(store.data.done.keys().cloned());
   let mut f_cid = dir_names(paths.www_root());
   for reserved in ["release", "builds.json", "index.html", "js", "css", "assets"] {
      f_cid.remove(reserved);
   }

   for cid in db_cid.difference(&f_cid) {
      println!("cid with no file:  {cid}");
   }
   for cid in f_cid.difference(&db_cid) {
      println!("File with no cid:  {cid}");
   }

   for cid in db_cid.intersection(&f_cid) {
      let change = store
         .data
         .change
         .get(cid)
         .or_else(|| store.data.done.get(cid))
         .expect("cid listed but not stored");
      let mut expected = BTreeSet::new();
      for build in &change.build {
         if !known_masters.contains(&build.parent) {
            println!("Unknown release: {cid} {}", build.parent);
         }
         expected.insert(paths.www(cid, build.version, &build.parent, None, true));
         if !build.picked.is_empty() {
            expected.insert(paths.www(cid, build.version, &build.parent, None, false));
         }
      }
      let mut found = BTreeSet::new();
      for version in dir_names(&paths.www_root().join(cid)) {
         let version_dir = paths.www_root().join(cid).join(&version);
         for master in dir_names(&version_dir) {
            found.insert(version_dir.join(master));
         }
      }
      for path in expected.difference(&found) {
         println!("No file:  {}", path.display());
      }
      for path in found.difference(&expected) {
         println!("No ref:  {}", path.display());
      }
   }

   Ok(())
}
