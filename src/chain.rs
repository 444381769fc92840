//! Per-proposal state machine: fetching, cherry-picking onto the base,
//! rebasing on top of parent proposals, and the bookkeeping branches that
//! persist all of it in the git repository.
//!
//! All shared state (the change table, the child index, the sha→cid cache)
//! lives in [`ChainSet`]; operations are methods taking the change id.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{BotError, Result};
use crate::gitutils::{GitRepo, change_id};
use crate::store::{ChangeRecord, Store};

/// Progress of a proposal. Only moves up through normal progress; any
/// downgrade clears all strictly-higher-state data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
   Deleted,
   New,
   Fetched,
   Picked,
   /// A member of the active parent chain could not be rebased.
   ConflictParent,
   /// This proposal itself could not be rebased.
   Conflict,
   Rebased,
}

#[derive(Debug)]
pub struct Change {
   pub cid: String,
   pub number: u64,
   pub version: u32,
   pub ref_name: String,
   /// Decorated tag of the base the slots below are relative to.
   pub base: String,
   pub state: State,
   pub fetched: Option<String>,
   pub picked: Option<String>,
   pub pick_conflicts: Vec<String>,
   pub rebased: Option<String>,
   pub rebased_conflicts: Vec<String>,
   /// cid whose rebase broke this chain (self for own conflicts).
   pub rebased_conflicting: Option<String>,
   /// Ancestor commits uploaded with the tip, mapped to their cids,
   /// nearest ancestor last.
   pub uploaded_chain: Vec<String>,
}

impl Change {
   pub fn fetched_branch_name(&self) -> String {
      changeset_branch_name(&self.cid, &self.version.to_string())
   }

   pub fn picked_branch_name(&self) -> String {
      format!(
         "{}{},{}",
         changeset_branch_name(&self.cid, "d/"),
         self.base,
         self.version_signature()
      )
   }

   pub fn version_signature(&self) -> String {
      format!("{:03x}", self.version)
   }

   fn is_fetched(&self) -> bool {
      self.state >= State::Fetched && self.fetched.is_some()
   }

   /// What children should propagate when this member of their chain is in a
   /// conflict state.
   fn conflict_origin(&self) -> Option<&str> {
      match self.state {
         State::Conflict | State::ConflictParent => self.rebased_conflicting.as_deref(),
         _ => None,
      }
   }
}

pub fn changeset_branch_name(cid: &str, suffix: &str) -> String {
   format!("changeset-{cid}-{suffix}")
}

pub struct ChainSet {
   repo: GitRepo,
   gerrit_url: String,
   /// Anonymous clone URL the change refs are fetched from.
   remote: String,
   base_commit: String,
   changes: BTreeMap<String, Change>,
   /// cid → set of cids whose uploaded chain contains it.
   children: HashMap<String, HashSet<String>>,
   sha_to_cid: HashMap<String, Option<String>>,
   /// Current-revision shas reported by the review server.
   revision_hints: HashMap<String, String>,
}

impl ChainSet {
   pub fn new(repo: GitRepo, gerrit_url: &str, remote: &str, base_commit: &str) -> Self {
      Self {
         repo,
         gerrit_url: gerrit_url.to_string(),
         remote: remote.to_string(),
         base_commit: base_commit.to_string(),
         changes: BTreeMap::new(),
         children: HashMap::new(),
         sha_to_cid: HashMap::new(),
         revision_hints: HashMap::new(),
      }
   }

   pub fn repo(&self) -> &GitRepo {
      &self.repo
   }

   pub fn change(&self, cid: &str) -> Option<&Change> {
      self.changes.get(cid)
   }

   /// Remember which change a server-side revision sha belongs to; used when
   /// an uploaded ancestor carries no usable trailer.
   pub fn note_revision(&mut self, sha: &str, cid: &str) {
      self.revision_hints.insert(sha.to_string(), cid.to_string());
   }

   /// Sync the engine with the store's active set: refresh known proposals,
   /// create new ones, drop the gone, fetch whatever is missing and prune
   /// obsolete bookkeeping branches.
   pub fn update_changes(&mut self, store: &Store) -> Result<()> {
      if let Some(current) = &store.data.current {
         self.set_base_commit(current.clone());
      }

      let mut active = HashSet::new();
      let records: Vec<(String, ChangeRecord)> = store
         .data
         .change
         .iter()
         .map(|(cid, record)| (cid.clone(), record.clone()))
         .collect();
      for (cid, record) in records {
         active.insert(cid.clone());
         if self.changes.contains_key(&cid) {
            self.update(&cid, &record)?;
         } else {
            self.insert_change(&cid, &record)?;
            // In case an abandoned change is resurrected
            self.downgrade_children(&cid);
         }
      }

      let gone: Vec<String> =
         self.changes.keys().filter(|cid| !active.contains(*cid)).cloned().collect();
      for cid in gone {
         self.delete(&cid);
         self.changes.remove(&cid);
      }

      let unfetched: Vec<String> = self
         .changes
         .values()
         .filter(|change| change.state < State::Fetched)
         .map(|change| change.cid.clone())
         .collect();
      self.fetch_changes(&unfetched)?;

      self.delete_obsolete_branches(store, 10)?;
      Ok(())
   }

   fn insert_change(&mut self, cid: &str, record: &ChangeRecord) -> Result<()> {
      let change = Change {
         cid: cid.to_string(),
         number: record.id,
         version: record.version,
         ref_name: record.ref_name.clone(),
         base: self.base_commit.clone(),
         state: State::New,
         fetched: None,
         picked: None,
         pick_conflicts: Vec::new(),
         rebased: None,
         rebased_conflicts: Vec::new(),
         rebased_conflicting: None,
         uploaded_chain: Vec::new(),
      };
      self.changes.insert(cid.to_string(), change);
      // The branch may survive from an earlier run; reuse it.
      self.check_fetched(cid)?;
      Ok(())
   }

   pub fn update(&mut self, cid: &str, record: &ChangeRecord) -> Result<()> {
      {
         let change = self
            .changes
            .get(cid)
            .ok_or_else(|| BotError::Other(format!("unknown change {cid}")))?;
         if change.number != record.id {
            return Err(BotError::Other(format!(
               "updated with different id: {} -> {}",
               change.number, record.id
            )));
         }
      }
      let base = self.base_commit.clone();
      let (version_changed, base_changed) = {
         let change = self.changes.get_mut(cid).unwrap();
         let version_changed = change.version != record.version;
         change.ref_name = record.ref_name.clone();
         (version_changed, change.base != base)
      };
      if version_changed {
         self.changes.get_mut(cid).unwrap().base = base.clone();
         self.downgrade(cid, State::New);
         self.changes.get_mut(cid).unwrap().version = record.version;
      } else if base_changed {
         self.changes.get_mut(cid).unwrap().base = base;
         self.downgrade(cid, State::Fetched);
      }
      Ok(())
   }

   pub fn set_base_commit(&mut self, commit: String) {
      if commit == self.base_commit {
         return;
      }
      self.base_commit = commit.clone();
      let cids: Vec<String> = self.changes.keys().cloned().collect();
      for cid in cids {
         if self.changes[&cid].base != commit {
            self.changes.get_mut(&cid).unwrap().base = commit.clone();
            self.downgrade(&cid, State::Fetched);
         }
      }
   }

   pub fn delete(&mut self, cid: &str) {
      if self.changes.get(cid).is_none_or(|c| c.state <= State::Deleted) {
         return;
      }
      self.downgrade(cid, State::Deleted);
   }

   fn downgrade_children(&mut self, cid: &str) {
      let children: Vec<String> =
         self.children.get(cid).map(|set| set.iter().cloned().collect()).unwrap_or_default();
      for child in children {
         if self.changes.contains_key(&child) {
            self.downgrade(&child, State::Picked);
         }
      }
   }

   /// Move a change down to `target`, clearing all data that belongs to
   /// strictly higher states, and cascade to every change whose uploaded
   /// chain contains it.
   fn downgrade(&mut self, cid: &str, target: State) {
      let old_state;
      {
         let Some(change) = self.changes.get_mut(cid) else {
            return;
         };
         if change.state <= target {
            return;
         }
         old_state = change.state;
         if old_state > State::Picked && State::Picked >= target {
            change.rebased_conflicting = None;
            change.rebased_conflicts.clear();
            change.rebased = None;
         }
         if old_state > State::Fetched && State::Fetched >= target {
            change.pick_conflicts.clear();
            change.picked = None;
         }
         change.state = target;
      }
      if old_state > State::New && State::New >= target {
         self.changes.get_mut(cid).unwrap().fetched = None;
         self.rebuild_uploaded_chain(cid);
      }
      self.downgrade_children(cid);
   }

   fn forced_fetch_refspec(change: &Change) -> String {
      format!("+{}:{}", change.ref_name, change.fetched_branch_name())
   }

   fn check_fetched(&mut self, cid: &str) -> Result<()> {
      let (branch_name, done) = {
         let change = &self.changes[cid];
         (change.fetched_branch_name(), change.state >= State::Fetched)
      };
      if done {
         return Ok(());
      }
      match self.repo.branch_commit(&branch_name)? {
         Some(commit) => {
            self.sha_to_cid.insert(commit.clone(), Some(cid.to_string()));
            let change = self.changes.get_mut(cid).unwrap();
            change.fetched = Some(commit);
            change.state = State::Fetched;
            self.rebuild_uploaded_chain(cid);
         }
         None => self.changes.get_mut(cid).unwrap().fetched = None,
      }
      Ok(())
   }

   /// Fetch a single change if needed and return its tip.
   pub fn fetch(&mut self, cid: &str) -> Result<Option<String>> {
      let Some(change) = self.changes.get(cid) else {
         return Ok(None);
      };
      if change.state < State::New {
         return Ok(None);
      }
      if change.state < State::Fetched {
         let refspec = Self::forced_fetch_refspec(change);
         self.repo.fetch(&self.remote, &[refspec])?;
         self.check_fetched(cid)?;
      }
      Ok(self.changes[cid].fetched.clone())
   }

   /// Fetch a batch of changes with one git invocation.
   pub fn fetch_changes(&mut self, cids: &[String]) -> Result<()> {
      let refspecs: Vec<String> = cids
         .iter()
         .filter_map(|cid| self.changes.get(cid))
         .filter(|change| change.state < State::Fetched && change.state >= State::New)
         .map(Self::forced_fetch_refspec)
         .collect();
      if refspecs.is_empty() {
         return Ok(());
      }
      self.repo.fetch(&self.remote, &refspecs)?;
      for cid in cids {
         if self.changes.contains_key(cid.as_str()) {
            self.check_fetched(cid)?;
         }
      }
      Ok(())
   }

   fn rebuild_uploaded_chain(&mut self, cid: &str) {
      let old_chain = std::mem::take(&mut self.changes.get_mut(cid).unwrap().uploaded_chain);
      for ancestor in old_chain {
         if let Some(set) = self.children.get_mut(&ancestor) {
            set.remove(cid);
         }
      }

      let (base, fetched) = {
         let change = &self.changes[cid];
         (change.base.clone(), change.fetched.clone())
      };
      let Some(fetched) = fetched else {
         return;
      };
      let history = match self.repo.history(&base, &fetched) {
         Ok(history) => history,
         Err(err) => {
            warn!(cid, %err, "cannot walk uploaded chain");
            return;
         }
      };
      // All ancestors below the tip itself.
      let ancestors: Vec<String> = history[..history.len().saturating_sub(1)].to_vec();
      for commit in &ancestors {
         if let Some(ancestor_cid) = self.get_cid(commit) {
            self.changes.get_mut(cid).unwrap().uploaded_chain.push(ancestor_cid.clone());
            self.children.entry(ancestor_cid).or_default().insert(cid.to_string());
         }
      }
   }

   /// Map a commit to the change it belongs to, via the sha cache, its
   /// trailers, then the review server's revision hints. A commit with
   /// contradictory trailers is refused any association.
   fn get_cid(&mut self, commit: &str) -> Option<String> {
      if let Some(cached) = self.sha_to_cid.get(commit) {
         return cached.clone();
      }
      let cid = match self.repo.commit_message(commit) {
         Ok(message) => match change_id(&message, commit, &self.gerrit_url) {
            Ok(cid) => cid,
            Err(err) => {
               warn!(commit, %err, "refusing to associate malformed commit");
               None
            }
         },
         Err(err) => {
            debug!(commit, %err, "cannot read commit message");
            None
         }
      };
      let cid = cid.or_else(|| self.revision_hints.get(commit).cloned());
      self.sha_to_cid.insert(commit.to_string(), cid.clone());
      cid
   }

   /// Create `branch_name` at `onto` and cherry-pick the change's fetched tip
   /// onto it. On conflict the unmerged paths are recorded and everything is
   /// rolled back.
   fn pick_on_top(
      &mut self,
      cid: &str,
      onto: &str,
      branch_name: &str,
   ) -> Result<(Option<String>, Vec<String>)> {
      let Some(fetched) = self.fetch(cid)? else {
         return Ok((None, Vec::new()));
      };
      if let Some(commit) = self.repo.branch_commit(branch_name)? {
         return Ok((Some(commit), Vec::new()));
      }
      self.repo.create_branch(branch_name, onto)?;
      self.repo.checkout_branch(branch_name)?;
      if self.repo.cherry_pick(&fetched)? {
         Ok((self.repo.branch_commit(branch_name)?, Vec::new()))
      } else {
         let conflicts = self.repo.unmerged_paths()?;
         if let Err(err) = self.repo.cherry_pick_abort() {
            debug!(%err, "cherry-pick abort after failed pick");
         }
         self.repo.checkout_detached(&fetched)?;
         self.repo.delete_branches(&[branch_name.to_string()])?;
         Ok((None, conflicts))
      }
   }

   /// Cherry-pick the change onto the current base. When the uploaded tip
   /// already sits directly on the base it is reused as-is.
   pub fn pick(&mut self, cid: &str) -> Result<(Option<String>, Vec<String>)> {
      if !self.changes.contains_key(cid) {
         return Ok((None, Vec::new()));
      }
      let state = self.changes[cid].state;
      if state >= State::New && state < State::Picked {
         if let Some(tip) = self.fetch(cid)? {
            let (branch_name, base) = {
               let change = self.changes.get_mut(cid).unwrap();
               change.state = State::Picked;
               (change.picked_branch_name(), change.base.clone())
            };
            let parents = self.repo.commit_parents(&tip)?;
            let base_sha = self.repo.rev_parse(&base)?;
            if parents.len() == 1 && parents[0] == base_sha {
               if self.repo.branch_commit(&branch_name)?.is_none() {
                  self.repo.create_branch(&branch_name, &tip)?;
               }
               self.changes.get_mut(cid).unwrap().picked = Some(tip);
            } else {
               let (picked, conflicts) = self.pick_on_top(cid, &base, &branch_name)?;
               let change = self.changes.get_mut(cid).unwrap();
               change.picked = picked;
               change.pick_conflicts = conflicts;
            }
         }
      }
      let change = &self.changes[cid];
      Ok((change.picked.clone(), change.pick_conflicts.clone()))
   }

   pub fn version_signature(&self, cid: &str) -> String {
      self.changes[cid].version_signature()
   }

   /// `<version>[,<parent-number:x><parent-version:03x>]*`, root-most parent
   /// first. Distinct parent chains over the same base get distinct
   /// signatures.
   pub fn chain_signature(&self, cid: &str) -> String {
      let mut signature = vec![self.changes[cid].version_signature()];
      if self.changes[cid].is_fetched() {
         let chain = self.active_chain(cid);
         for ancestor in &chain[..chain.len().saturating_sub(1)] {
            let change = &self.changes[ancestor];
            signature.push(format!("{:x}{:03x}", change.number, change.version));
         }
      }
      signature.join(",")
   }

   pub fn rebased_branch_name(&self, cid: &str) -> String {
      let change = &self.changes[cid];
      format!(
         "{}{},{}",
         changeset_branch_name(cid, "d/"),
         change.base,
         self.chain_signature(cid)
      )
   }

   /// Nearest uploaded ancestor that is currently fetched.
   pub fn active_parent(&self, cid: &str) -> Option<String> {
      let change = self.changes.get(cid)?;
      if !change.is_fetched() {
         return None;
      }
      change
         .uploaded_chain
         .iter()
         .rev()
         .find(|ancestor| self.changes.get(*ancestor).is_some_and(Change::is_fetched))
         .cloned()
   }

   /// Chain of fetched proposals from the root ancestor down to `cid`
   /// itself. Cycles are impossible: parents are strict commit ancestors.
   pub fn active_chain(&self, cid: &str) -> Vec<String> {
      let mut chain = Vec::new();
      if !self.changes.get(cid).is_some_and(Change::is_fetched) {
         return chain;
      }
      let mut cursor = Some(cid.to_string());
      while let Some(current) = cursor {
         cursor = self.active_parent(&current);
         chain.push(current);
      }
      chain.reverse();
      chain
   }

   /// All maximal active chains this change is a member of.
   pub fn containing_chains(&self, cid: &str) -> Vec<Vec<String>> {
      if !self.changes.get(cid).is_some_and(Change::is_fetched) {
         return Vec::new();
      }
      let mut chains = vec![self.active_chain(cid)];
      let mut sets: Vec<HashSet<String>> =
         vec![chains[0].iter().cloned().collect()];
      let Some(children) = self.children.get(cid) else {
         return chains;
      };
      let mut children: Vec<&String> = children.iter().collect();
      children.sort();
      for child in children {
         let candidate = self.active_chain(child);
         if !candidate.iter().any(|member| member == cid) {
            continue;
         }
         let candidate_set: HashSet<String> = candidate.iter().cloned().collect();
         let mut placed = false;
         for (i, set) in sets.iter().enumerate() {
            if candidate_set.is_superset(set) {
               chains[i] = candidate.clone();
               sets[i] = candidate_set.clone();
               placed = true;
               break;
            }
            if candidate_set.is_subset(set) {
               placed = true;
               break;
            }
         }
         if !placed {
            chains.push(candidate);
            sets.push(candidate_set);
         }
      }
      chains
   }

   /// Rebase `cid` on top of its active parent chain. Walks the chain from
   /// the root downward so every member's rebased tip is ready when its
   /// child needs it.
   pub fn rebase(&mut self, cid: &str) -> Result<(Option<String>, Vec<String>, Option<String>)> {
      if !self.changes.contains_key(cid) {
         return Ok((None, Vec::new(), None));
      }
      if self.changes[cid].state < State::Rebased {
         // active_chain wants fetch state; make sure it is current.
         self.fetch(cid)?;
         let chain = self.active_chain(cid);
         for member in &chain {
            self.rebase_step(member)?;
         }
         if chain.is_empty() {
            // Not fetched; still run the local part for state consistency.
            self.rebase_step(cid)?;
         }
      }
      let change = &self.changes[cid];
      Ok((
         change.rebased.clone(),
         change.rebased_conflicts.clone(),
         change.rebased_conflicting.clone(),
      ))
   }

   fn rebase_step(&mut self, cid: &str) -> Result<()> {
      let state = self.changes[cid].state;
      if state > State::Picked {
         // Rebased, Conflict or ConflictParent: nothing left to do until a
         // downgrade clears the slot.
         return Ok(());
      }
      self.pick(cid)?;
      {
         let change = self.changes.get_mut(cid).unwrap();
         change.rebased_conflicting = None;
         change.rebased_conflicts.clear();
      }
      if self.changes[cid].fetched.is_none() {
         return Ok(());
      }

      let branch_name = self.rebased_branch_name(cid);
      if let Some(commit) = self.repo.branch_commit(&branch_name)? {
         let change = self.changes.get_mut(cid).unwrap();
         change.rebased = Some(commit);
         change.state = State::Rebased;
         return Ok(());
      }

      match self.active_parent(cid) {
         Some(parent_cid) => {
            let parent = &self.changes[&parent_cid];
            if let Some(origin) = parent.conflict_origin() {
               let origin = origin.to_string();
               let change = self.changes.get_mut(cid).unwrap();
               change.state = State::ConflictParent;
               change.rebased_conflicting = Some(origin);
            } else if let Some(parent_tip) = parent.rebased.clone() {
               let (rebased, conflicts) = self.pick_on_top(cid, &parent_tip, &branch_name)?;
               let change = self.changes.get_mut(cid).unwrap();
               change.rebased = rebased;
               change.rebased_conflicts = conflicts;
               if change.rebased.is_some() {
                  change.state = State::Rebased;
               } else {
                  change.state = State::Conflict;
                  change.rebased_conflicting = Some(cid.to_string());
               }
            } else {
               // Parent is fetched but its rebase never produced a tip;
               // treat it as the chain breaking at the parent.
               let change = self.changes.get_mut(cid).unwrap();
               change.state = State::ConflictParent;
               change.rebased_conflicting = Some(parent_cid);
            }
         }
         None => {
            let change = self.changes.get_mut(cid).unwrap();
            change.rebased = change.picked.clone();
            change.rebased_conflicts = change.pick_conflicts.clone();
            if change.rebased.is_some() {
               // pick and rebase branches share the same name here
               change.state = State::Rebased;
            } else {
               change.state = State::Conflict;
               change.rebased_conflicting = Some(cid.to_string());
            }
         }
      }
      Ok(())
   }

   /// Delete bookkeeping branches no in-use signature claims, keeping the
   /// `keep` newest per change. In-use means the current picked/rebased
   /// signature or any `parent,version` recorded in build history.
   pub fn delete_obsolete_branches(&self, store: &Store, keep: usize) -> Result<()> {
      let mut index: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
      for (cid, change) in &self.changes {
         let prefix = changeset_branch_name(cid, "d");
         let mut used = vec![format!("{},{}", change.base, change.version_signature())];
         for group in [&store.data.change, &store.data.done] {
            if let Some(record) = group.get(cid) {
               for build in &record.build {
                  used.push(format!("{},{:03x}", build.parent, build.version));
               }
            }
         }
         index.insert(prefix, (used, Vec::new()));
      }

      for branch in self.repo.list_branches()? {
         let Some((head, tail)) = branch.split_once('/') else {
            continue;
         };
         if let Some((used, obsolete)) = index.get_mut(head) {
            if !used.iter().any(|sig| tail.starts_with(sig.as_str())) {
               obsolete.push(branch);
            }
         }
      }

      let mut delete = Vec::new();
      for (_, (_, mut obsolete)) in index {
         if keep > 0 {
            if obsolete.len() > keep {
               obsolete.sort();
               obsolete.truncate(obsolete.len() - keep);
               delete.extend(obsolete);
            }
         } else {
            delete.extend(obsolete);
         }
      }
      delete.sort();
      self.repo.delete_branches(&delete)
   }
}
