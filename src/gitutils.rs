//! Thin subprocess facade over the on-disk git repository.
//!
//! Every operation shells out to `git` in the builder worktree; stderr is
//! folded into the error message. Bookkeeping state for in-progress replays
//! is read straight from the files git leaves under `.git`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{BotError, Result};

#[derive(Debug, Clone)]
pub struct GitRepo {
   dir: PathBuf,
}

impl GitRepo {
   pub fn new(dir: impl Into<PathBuf>) -> Self {
      Self { dir: dir.into() }
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }

   fn output(&self, args: &[&str]) -> Result<std::process::Output> {
      Command::new("git")
         .args(args)
         .current_dir(&self.dir)
         .output()
         .map_err(|e| BotError::GitError(format!("failed to run git {}: {e}", args.join(" "))))
   }

   fn run(&self, args: &[&str]) -> Result<String> {
      let output = self.output(args)?;
      if !output.status.success() {
         let stderr = String::from_utf8_lossy(&output.stderr);
         return Err(BotError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
         )));
      }
      Ok(String::from_utf8_lossy(&output.stdout).to_string())
   }

   /// Like `run`, but a non-zero exit is an expected outcome, not an error.
   fn run_ok(&self, args: &[&str]) -> Result<bool> {
      Ok(self.output(args)?.status.success())
   }

   pub fn rev_parse(&self, rev: &str) -> Result<String> {
      Ok(self.run(&["rev-parse", "--verify", rev])?.trim().to_string())
   }

   /// Commit a local branch points at, or None when the branch does not
   /// exist. Absence is an ordinary answer here, not an error.
   pub fn branch_commit(&self, name: &str) -> Result<Option<String>> {
      let output =
         self.output(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")])?;
      if output.status.success() {
         Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
      } else {
         Ok(None)
      }
   }

   pub fn create_branch(&self, name: &str, commit: &str) -> Result<()> {
      self.run(&["branch", name, commit])?;
      Ok(())
   }

   /// Move a branch that is not checked out.
   pub fn force_branch(&self, name: &str, commit: &str) -> Result<()> {
      self.run(&["branch", "-f", name, commit])?;
      Ok(())
   }

   pub fn delete_branches(&self, names: &[String]) -> Result<()> {
      if names.is_empty() {
         return Ok(());
      }
      let mut args = vec!["branch", "-D"];
      args.extend(names.iter().map(String::as_str));
      self.run(&args)?;
      Ok(())
   }

   pub fn list_branches(&self) -> Result<Vec<String>> {
      let out = self.run(&["for-each-ref", "refs/heads", "--format=%(refname:short)"])?;
      Ok(out.lines().map(str::to_string).collect())
   }

   pub fn checkout_branch(&self, name: &str) -> Result<()> {
      self.run(&["checkout", "-f", name])?;
      Ok(())
   }

   pub fn checkout_detached(&self, commit: &str) -> Result<()> {
      self.run(&["checkout", "-f", "--detach", commit])?;
      Ok(())
   }

   /// Check out `branch` and move it to `commit`, discarding local state.
   pub fn reset_branch_hard(&self, branch: &str, commit: &str) -> Result<()> {
      self.checkout_branch(branch)?;
      self.run(&["reset", "--hard", commit])?;
      Ok(())
   }

   pub fn fetch(&self, url: &str, refspecs: &[String]) -> Result<()> {
      let mut args = vec!["fetch", url];
      args.extend(refspecs.iter().map(String::as_str));
      self.run(&args)?;
      Ok(())
   }

   /// Fetch the upstream of a tracking branch (with tags) and return the
   /// remote tip commit.
   pub fn fetch_tracking(&self, branch: &str) -> Result<String> {
      let remote = self.run(&["config", &format!("branch.{branch}.remote")])?;
      let remote = remote.trim();
      let merge = self.run(&["config", &format!("branch.{branch}.merge")])?;
      let head = merge.trim().strip_prefix("refs/heads/").unwrap_or(merge.trim()).to_string();
      self.run(&["fetch", "--tags", remote, &head])?;
      self.rev_parse(&format!("{remote}/{head}"))
   }

   /// Commits reachable from `b` but not from `a`, topological order, oldest
   /// first.
   pub fn history(&self, a: &str, b: &str) -> Result<Vec<String>> {
      let out = self.run(&["rev-list", "--topo-order", "--reverse", &format!("{a}..{b}")])?;
      Ok(out.lines().map(str::to_string).collect())
   }

   /// Write per-commit patch files for `range` into `outdir`; returns the
   /// patch file names.
   pub fn format_patch(&self, range: &str, outdir: &Path) -> Result<Vec<String>> {
      let outdir = outdir.to_string_lossy();
      let out = self.run(&["format-patch", "--numstat", "-o", &outdir, range])?;
      Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
   }

   /// Apply `commit` on top of HEAD. Ok(false) means the pick stopped on
   /// conflicts and is waiting for resolution or abort.
   pub fn cherry_pick(&self, commit: &str) -> Result<bool> {
      self.run_ok(&["cherry-pick", commit])
   }

   pub fn cherry_pick_abort(&self) -> Result<()> {
      self.run(&["cherry-pick", "--abort"])?;
      Ok(())
   }

   pub fn rebase_abort(&self) -> Result<bool> {
      self.run_ok(&["rebase", "--abort"])
   }

   pub fn unmerged_paths(&self) -> Result<Vec<String>> {
      let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
      Ok(out.lines().map(str::to_string).collect())
   }

   /// The commit currently being applied by an in-progress rebase or
   /// cherry-pick, read from git's own bookkeeping files.
   pub fn currently_replaying(&self) -> Result<Option<String>> {
      let git_dir = self.run(&["rev-parse", "--git-dir"])?;
      let git_dir = self.dir.join(git_dir.trim());
      for marker in ["REBASE_HEAD", "rebase-apply/original-commit", "CHERRY_PICK_HEAD"] {
         if let Some(commit) = commit_from_git_file(&git_dir.join(marker)) {
            return Ok(Some(commit));
         }
      }
      Ok(None)
   }

   /// Tag name for a commit when one points exactly at it.
   pub fn describe_exact(&self, commit: &str) -> Result<Option<String>> {
      let output = self.output(&["describe", "--tags", "--exact-match", commit])?;
      if output.status.success() {
         Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
      } else {
         Ok(None)
      }
   }

   /// `<nearest-tag>-<offset>` for a commit past the last tag; falls back to
   /// the commit id when no tag is reachable.
   pub fn describe_long(&self, commit: &str) -> Result<String> {
      let output = self.output(&["describe", "--tags", "--long", commit])?;
      if !output.status.success() {
         return Ok(commit.to_string());
      }
      let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
      // hrev57000-5-gabcdef -> hrev57000-5
      Ok(name.rfind('-').map_or(name.clone(), |pos| name[..pos].to_string()))
   }

   pub fn commit_parents(&self, commit: &str) -> Result<Vec<String>> {
      let out = self.run(&["rev-list", "--parents", "-n", "1", commit])?;
      Ok(out.split_whitespace().skip(1).map(str::to_string).collect())
   }

   pub fn commit_tree(&self, commit: &str) -> Result<String> {
      self.rev_parse(&format!("{commit}^{{tree}}"))
   }

   pub fn commit_message(&self, commit: &str) -> Result<String> {
      self.run(&["log", "-1", "--format=%B", commit])
   }

   pub fn commit_summary(&self, commit: &str) -> Result<String> {
      Ok(self.run(&["log", "-1", "--format=%s", commit])?.trim().to_string())
   }
}

fn commit_from_git_file(path: &Path) -> Option<String> {
   let contents = std::fs::read_to_string(path).ok()?;
   let line = contents.lines().next()?.trim();
   if line.is_empty() { None } else { Some(line.to_string()) }
}

const WHITESPACE: &[char] = &[' ', '\x0c', '\n', '\r', '\t', '\x0b'];

fn has_whitespace(s: &str) -> bool {
   s.contains(WHITESPACE)
}

/// Parse the trailer block of a commit message into `(key, value)` pairs.
///
/// Comment lines are dropped and a `---` scissors line ends the message.
/// Continuation lines are unfolded into the preceding trailer. The last
/// blank-separated paragraph is the candidate block; it only counts as
/// trailers when every line parses, or when a `Signed-off-by` /
/// `(cherry picked from commit` marker is present and trailers make up more
/// than a third of the lines.
pub fn trailers_list(text: &str) -> Vec<(String, String)> {
   let mut lines: Vec<String> = Vec::new();
   for line in text.lines() {
      if line.starts_with('#') {
         continue;
      }
      if let Some(rest) = line.strip_prefix("---") {
         match rest.chars().next() {
            None => break,
            Some(c) if WHITESPACE.contains(&c) => break,
            Some(_) => {}
         }
      }
      if line.trim_matches(WHITESPACE).is_empty() {
         lines.push(String::new());
      } else if line.starts_with(WHITESPACE)
         && lines.last().is_some_and(|prev| !prev.is_empty() && prev.contains(':'))
      {
         // Unfold, even though this may flatten multi-line trailers like
         // Conflicts:
         let prev = lines.last_mut().unwrap();
         let folded =
            format!("{} {}", prev.trim_matches(WHITESPACE), line.trim_matches(WHITESPACE));
         *prev = folded;
      } else {
         lines.push(line.to_string());
      }
   }

   let mut paragraphs: Vec<Vec<&str>> = Vec::new();
   let mut current: Vec<&str> = Vec::new();
   for line in &lines {
      if line.is_empty() {
         if !current.is_empty() {
            paragraphs.push(std::mem::take(&mut current));
         }
      } else {
         current.push(line);
      }
   }
   if !current.is_empty() {
      paragraphs.push(current);
   }

   let mut trailers = Vec::new();
   if paragraphs.len() > 1 {
      let block = paragraphs.last().unwrap();
      let mut special = false;
      for line in block {
         let Some((key, value)) = line.split_once(':') else {
            continue;
         };
         if key.is_empty() || key.starts_with(WHITESPACE) {
            continue;
         }
         let key = key.trim_matches(WHITESPACE);
         if has_whitespace(key) {
            continue;
         }
         if key == "Signed-off-by" || key == "(cherry picked from commit" {
            special = true;
         }
         trailers.push((key.to_string(), value.trim_matches(WHITESPACE).to_string()));
      }
      let n_trailers = trailers.len();
      let n_lines = block.len();
      if !(n_trailers == n_lines || (special && n_trailers * 3 > n_lines)) {
         trailers.clear();
      }
   }

   trailers
}

/// Extract the change id a commit belongs to, from its `Change-Id` trailer or
/// a `Link:` trailer matching the review URL the commit-msg hook writes.
/// Two different values in one message make the commit unusable.
pub fn change_id(message: &str, commit: &str, gerrit_url: &str) -> Result<Option<String>> {
   let mut prefix = gerrit_url.to_string();
   if !prefix.ends_with('/') {
      prefix.push('/');
   }
   prefix.push_str("id/");

   let mut cid: Option<String> = None;
   for (key, value) in trailers_list(message) {
      let value = match key.to_lowercase().as_str() {
         "change-id" => value,
         "link" => {
            let Some(rest) = value.strip_prefix(&prefix) else {
               continue;
            };
            if rest.len() < 41 || !rest.starts_with('I') {
               continue;
            }
            if !rest[1..].chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
               continue;
            }
            rest.to_string()
         }
         _ => continue,
      };
      if let Some(existing) = &cid {
         if *existing != value {
            return Err(BotError::MalformedCommit { commit: commit.to_string() });
         }
      }
      cid = Some(value);
   }
   Ok(cid)
}
