//! Streaming classifier over build logs.
//!
//! Each line becomes a warning, error, package or failure item (or nothing).
//! Compiler messages are matched with two regexes (a strict one requiring a
//! severity word and a loose fallback); jam, linker, catalog and download
//! lines are matched on literal prefixes/suffixes. Message texts are interned
//! into insertion-ordered ids so analyses of different builds can be compared
//! per file.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use tracing::debug;

use crate::paths::{Paths, relative_path};

// sFile:nLine:nRow: error: sText [-Werror=sErr]
// sFile:nLine:nRow: fatal error: sFile2: No such file or directory
// sFile:nLine(:nRow)?: warning: sText ([-WsWarn])?
static RE_COMPILER_MSG: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(
      r"^(?P<file>.*?):(?P<line>\d*):(?:(?P<row>\d*):)? (?P<mode>warning|error|fatal error): (?P<msg>.*?(?:\[-W(?:error=)?(?P<error>.*)\])?)$",
   )
   .unwrap()
});

// Same shape without the severity word; output lines from tools that do not
// say "warning:" outright.
static RE_COMPILER_MSG2: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(
      r"^(?P<file>.*?):(?P<line>\d*):(?:(?P<row>\d*):)? (?P<msg>.*?(?:\[-W(?:error=)?(?P<error>.*)\])?)$",
   )
   .unwrap()
});

pub type MsgItem = (u32, u32, usize);
pub type FullItem = (u32, u32, String);
pub type FullMap = BTreeMap<String, Vec<FullItem>>;

#[derive(Debug, Default)]
pub struct Analysis {
   pub packages: BTreeSet<String>,
   pub failures: String,
   /// Interned message texts; the id of a message is its insertion index.
   pub messages: IndexSet<String>,
   /// Per source file: (log line, source line, message id).
   pub warnings: BTreeMap<String, Vec<MsgItem>>,
   pub errors: BTreeMap<String, Vec<MsgItem>>,
   /// Per source file: (log line, source line, raw message) for later diffs.
   pub full: FullMap,
}

impl Analysis {
   pub fn warning_count(&self) -> u32 {
      self.warnings.values().map(|v| v.len() as u32).sum()
   }

   pub fn error_count(&self) -> u32 {
      self.errors.values().map(|v| v.len() as u32).sum()
   }

   /// Message table as an id-indexed vector.
   pub fn message_table(&self) -> Vec<&str> {
      self.messages.iter().map(String::as_str).collect()
   }
}

/// Rewrites worktree, build root and buildtools root prefixes to the virtual
/// `/s`, `/b`, `/t` so logs read the same wherever the builder lives.
pub struct PathTransformer {
   rel_src: String,
   abs_src: String,
   build_root: String,
   bt_root: String,
}

impl PathTransformer {
   pub fn new(paths: &Paths) -> Self {
      let abs_src = paths.worktree().to_string_lossy().into_owned();
      let rel_src =
         relative_path(&paths.build("fake"), paths.worktree()).to_string_lossy().into_owned();
      Self {
         rel_src,
         abs_src,
         build_root: paths.build_root().to_string_lossy().into_owned(),
         bt_root: paths.buildtools_root().to_string_lossy().into_owned(),
      }
   }

   pub fn transform_line(&self, line: &str) -> String {
      line
         .replace(&self.rel_src, "/s")
         .replace(&self.abs_src, "/s")
         .replace(&self.build_root, "/b")
         .replace(&self.bt_root, "/t")
   }

   pub fn transform(&self, lines: &mut [String]) {
      for line in lines {
         *line = self.transform_line(line);
      }
   }
}

/// Infer a warning family from the message text when the compiler did not
/// name one; first matching rule wins, otherwise the message itself is the
/// key.
pub fn match_error_key(s: &str) -> &str {
   if s.ends_with("comparison between signed and unsigned") {
      return "sign-compare";
   }
   if s.contains(" be used uninitialized") {
      return "maybe-uninitialized";
   }
   if s.contains(" is used uninitialized") {
      return "uninitialized";
   }
   if s.starts_with("too many arguments for format") {
      return "format-extra-args";
   }
   if s.ends_with(" in format") {
      return "format=";
   }
   if s.starts_with("unused variable ") {
      return "unused-variable";
   }
   if s.starts_with("implicit declaration of function ") {
      return "implicit-function-declaration";
   }
   if s.starts_with("no previous prototype for ") {
      return "missing-prototypes";
   }
   if s.starts_with("pointer of type ") && s.ends_with(" used in arithmetic") {
      return "pointer-arith";
   }
   if s.starts_with("integer overflow in expression")
      || s.starts_with("large integer implicitly truncated")
   {
      return "overflow";
   }
   if s.ends_with(" redefined") {
      return "cpp-redefine";
   }
   if s.ends_with(" attribute directive ignored") {
      return "attributes";
   }
   if s.contains(" discards qualifiers ") {
      return "discarded-qualifiers";
   }
   if s.ends_with(" from incompatible pointer type") {
      return "incompatible-pointer-types";
   }
   if s.ends_with(" makes pointer from integer without a cast") {
      return "int-conversion";
   }
   if s.ends_with(")' defined but not used") {
      return "unused-function";
   }
   if s.ends_with("' defined but not used") {
      if s.starts_with("label ") {
         return "unused-label";
      }
      // could also be unused-const-variable=, unused-function...
      return "unused-variable";
   }
   if s.contains(" (arg ") {
      return "format=";
   }
   if s.ends_with("No such file or directory") {
      return "file-not-found";
   }
   if s.ends_with("empty declaration") {
      return "empty-declaration";
   }
   if s.ends_with(" does return") || s.contains(" non-void function") {
      return "return-type";
   }
   if s.starts_with("#warning ") {
      return "cpp";
   }
   if s.starts_with("initialization ") && s.contains("int") {
      return "int-conversion";
   }
   if s.starts_with("cast to pointer from integer of different size") {
      return "int-to-pointer-cast";
   }
   if s.contains(" clobbered ") {
      return "clobbered";
   }
   if s.ends_with(" was hidden") {
      return "hidden";
   }
   if s.ends_with(" some locales") {
      return "locales";
   }
   if s.starts_with("Unknown section") || s.starts_with("label alone ") {
      return "assembler";
   }
   if s.ends_with("undeclared (first use this function)")
      || s.ends_with("not declared")
      || s.ends_with("has not been declared")
   {
      return "undeclared";
   }
   if s.starts_with("no matching function for call to") {
      return "unmatched-call";
   }
   if (s.starts_with("prototype for") && s.contains(" does not match "))
      || s.starts_with("no declaration matches ")
   {
      return "unmatched-prototype";
   }
   if s.contains(" used where ") && s.contains(" was expected") {
      return "unmatched-type";
   }
   if s.starts_with("invalid use of undefined type") {
      return "undefined-type";
   }
   if s.starts_with("invalid conversion") || s.contains("cannot convert") || s.contains("lacks a cast")
   {
      return "invalid-conversion";
   }
   if s.ends_with("not declared in this scope") {
      return "undeclared";
   }
   if s.contains("declared inside parameter list") {
      return "invisible-outside";
   }
   if s.starts_with("forward declaration of ") {
      return "forward-declaration";
   }
   if s.starts_with("parse error")
      || s.starts_with("expected ")
      || s.starts_with("lvalue required")
      || s.starts_with("syntax error")
   {
      return "parse";
   }
   if s.contains("has incomplete type") {
      return "incomplete-type";
   }
   if s.contains(" has no member named ")
      || s.contains(" does not have a nested type ")
      || s.contains("does not name a type")
      || s.starts_with("request for member ")
   {
      return "undefined-type";
   }
   if s.starts_with("too few arguments") {
      return "too-few-arguments";
   }
   if s.contains("is not a pointer-to-object type") {
      return "delete-incomplete";
   }
   if s.starts_with("assignment to ") && (s.contains("float") || s.contains("double")) {
      return "float-conversion";
   }
   if s.starts_with("incompatible implicit declaration") {
      return "incompatible-implicit-declaration";
   }
   if s.starts_with("member initializers for") {
      return "reorder";
   }
   if s.starts_with("invalid type") || s.ends_with("with no type") {
      return "invalid-type";
   }
   if s.ends_with("is ambiguous") {
      return "ambiguous";
   }
   if s.contains("aggregate initializer") {
      return "invalid-offsetof";
   }
   if s.starts_with("conflicting types for") || s.ends_with("redeclared as different kind of symbol")
   {
      return "declaration-mismatch";
   }
   if s.starts_with("enumeration value") && s.ends_with("not handled in switch") {
      return "switch";
   }
   if s.starts_with("too many arguments") {
      return "extra-args";
   }
   s
}

enum Event {
   Warn(ItemData),
   Err(ItemData),
   Pkg(String),
   Fail(String),
}

struct ItemData {
   file: String,
   line: u32,
   msg: String,
   key: String,
}

impl ItemData {
   fn literal(origin: &str, msg: &str, key: &str) -> Self {
      Self { file: origin.to_string(), line: 0, msg: msg.to_string(), key: key.to_string() }
   }
}

/// Collapse `.` and `..` components the way os.path.normpath does.
fn normpath(path: &str) -> String {
   let absolute = path.starts_with('/');
   let mut parts: Vec<&str> = Vec::new();
   for part in path.split('/') {
      match part {
         "" | "." => {}
         ".." => {
            if parts.last().is_some_and(|p| *p != "..") {
               parts.pop();
            } else if !absolute {
               parts.push("..");
            }
         }
         _ => parts.push(part),
      }
   }
   let joined = parts.join("/");
   if absolute {
      format!("/{joined}")
   } else if joined.is_empty() {
      ".".to_string()
   } else {
      joined
   }
}

fn strip_src_prefix(file: &str) -> String {
   normpath(file.strip_prefix("/s/").unwrap_or(file))
}

fn compiler_item(caps: &regex::Captures, error_key: &str) -> ItemData {
   let file = strip_src_prefix(caps.name("file").map_or("", |m| m.as_str()));
   let line = caps.name("line").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
   let msg = caps.name("msg").map_or("", |m| m.as_str()).to_string();
   ItemData { file, line, msg, key: error_key.to_string() }
}

fn classify(line: &str) -> Vec<Event> {
   const PKG_SUFFIX: &str = ": Creating the package ...";

   if line.contains(" warning: ") || line.contains(" error: ") {
      if let Some(caps) = RE_COMPILER_MSG.captures(line) {
         let msg = caps.name("msg").map_or("", |m| m.as_str());
         if msg.starts_with(' ') {
            return Vec::new();
         }
         let key = match caps.name("error") {
            Some(m) => m.as_str().to_string(),
            None => match_error_key(msg).to_string(),
         };
         if key == msg {
            if key.starts_with("this is the location")
               || key.starts_with("by ")
               || key.starts_with("its scope is only")
               || key.starts_with("In function")
               || key.starts_with("At top level")
               || key.contains("/s/")
               || key.contains("warning: ")
            {
               return Vec::new();
            }
            debug!(%key, line, "unclassified compiler message kept verbatim");
         }
         let item = compiler_item(&caps, &key);
         return if caps.name("mode").is_some_and(|m| m.as_str() == "warning") {
            vec![Event::Warn(item)]
         } else {
            vec![Event::Err(item)]
         };
      }
      if line.contains("ld: warning") && line.contains(" needed by ") && line.contains(" not found ")
      {
         return vec![Event::Warn(ItemData::literal("ld", line, "lib-not-found"))];
      }
      if line.starts_with("collect2: error: ld returned") {
         return vec![Event::Err(ItemData::literal("ld", line, "linker"))];
      }
      if !line.contains("dprintf(\"dosfs error: ") && !line.contains("In function") {
         debug!(line, "warn/error line not matched");
      }
      return Vec::new();
   }
   if line.starts_with("collect2: ld returned") {
      return vec![Event::Err(ItemData::literal("ld", line, "linker"))];
   }
   if line.starts_with("Warning: couldn't resolve catalog-access:") {
      return vec![Event::Warn(ItemData::literal("catkeys", line, "catalog"))];
   }
   if line.starts_with("warning: using independent target") {
      return vec![Event::Warn(ItemData::literal("jambuild", line, "jam-independent-target"))];
   }
   if line.starts_with("build-feature packages unavailable") {
      let (head, pkglist) = line.split_once(':').unwrap_or((line, ""));
      return pkglist
         .split_whitespace()
         .map(|pkg| {
            Event::Warn(ItemData::literal(
               "jambuild",
               &format!("{head}: {pkg}"),
               "jam-unavailable-build-pkg",
            ))
         })
         .collect();
   }
   if line.starts_with("AddHaikuImagePackages: package") && line.ends_with(" not available! ") {
      return vec![Event::Warn(ItemData::literal("jambuild", line, "jam-unavailable-pkg"))];
   }
   if line.starts_with("warning: unknown rule ") {
      return vec![Event::Warn(ItemData::literal("jambuild", line, "jam-rule"))];
   }
   if ((line.starts_with("...failed ") || line.starts_with("...can't ")) && line.ends_with("..."))
      || line.starts_with("don't know how to")
   {
      return vec![
         Event::Fail(line.to_string()),
         Event::Err(ItemData::literal("jambuild", line, "jam-fail")),
      ];
   }
   if let Some(pkg) = line.strip_suffix(PKG_SUFFIX) {
      if pkg.ends_with(".hpkg") {
         return vec![Event::Pkg(pkg.to_string())];
      }
   }
   if (line.starts_with("ERROR: ") && line.contains(" dependenc"))
      || (line.starts_with("problem") && line.contains(" nothing provides "))
   {
      return vec![Event::Err(ItemData::literal("jambuild", line, "jam-dependencies"))];
   }
   if line.starts_with("failed: Connection timed out.") {
      return vec![Event::Err(ItemData::literal("connection", line, "timeout"))];
   }

   // Loose fallback: compiler-shaped lines without a severity word.
   if let Some(caps) = RE_COMPILER_MSG2.captures(line) {
      let msg = caps.name("msg").map_or("", |m| m.as_str());
      if msg.starts_with("note: ")
         || msg.starts_with("required from ")
         || msg.starts_with(' ')
         || msg.contains("reported only once")
         || msg.contains("for each function")
      {
         return Vec::new();
      }
      let file = caps.name("file").map_or("", |m| m.as_str());
      let file_tokens: Vec<&str> = file.split_whitespace().collect();
      if (file_tokens.len() > 1 && !file_tokens[0].contains('/')) || file.contains(':') {
         // Probably interleaved output from two processes
         return Vec::new();
      }
      let key = match caps.name("error") {
         Some(m) => m.as_str().to_string(),
         None => {
            let key = match_error_key(msg);
            if key == msg {
               if !(msg.starts_with("In file included from ")
                  || msg.starts_with("In function")
                  || msg.starts_with("at this point in file")
                  || msg.starts_with("candidates are: ")
                  || msg.starts_with("candidate is: ")
                  || msg.starts_with("previous declaration")
                  || msg.contains("previously defined here"))
               {
                  debug!(msg, line, "possible unmatched warning");
               }
               return Vec::new();
            }
            key.to_string()
         }
      };
      let is_err = matches!(key.as_str(), "file-not-found" | "invalid-type" | "ambiguous" | "undefined-type")
         || key.starts_with("unmatched")
         || msg.to_lowercase().contains("error");
      let item = compiler_item(&caps, &key);
      return if is_err { vec![Event::Err(item)] } else { vec![Event::Warn(item)] };
   }
   Vec::new()
}

/// Classify every line of a (path-transformed) log.
pub fn analyse<S: AsRef<str>>(log: &[S]) -> Analysis {
   let mut analysis = Analysis::default();
   let mut failures = Vec::new();
   for (idx, line) in log.iter().enumerate() {
      let lineno = idx as u32 + 1;
      for event in classify(line.as_ref()) {
         match event {
            Event::Warn(item) => record(&mut analysis, lineno, item, true),
            Event::Err(item) => record(&mut analysis, lineno, item, false),
            Event::Pkg(name) => {
               analysis.packages.insert(name);
            }
            Event::Fail(line) => failures.push(line),
         }
      }
   }
   analysis.failures = failures.join("\n");
   analysis
}

fn record(analysis: &mut Analysis, lineno: u32, item: ItemData, warning: bool) {
   let (id, _) = analysis.messages.insert_full(item.key);
   let bucket = if warning {
      analysis.warnings.entry(item.file.clone()).or_default()
   } else {
      analysis.errors.entry(item.file.clone()).or_default()
   };
   bucket.push((lineno, item.line, id));
   analysis.full.entry(item.file).or_default().push((lineno, item.line, item.msg));
}

/// Per-file message delta between two analyses, bucketed by message text.
/// Returns `(removed, added)`; each bucket contributes its multiplicity
/// difference, and order within a file follows the new side.
pub fn diff(old: &FullMap, new: &FullMap) -> (FullMap, FullMap) {
   let mut removed: FullMap = BTreeMap::new();
   let mut added: FullMap = BTreeMap::new();
   for (file, old_items) in old {
      let Some(new_items) = new.get(file) else {
         removed.insert(file.clone(), old_items.clone());
         continue;
      };
      let mut old_buckets: IndexMap<&str, Vec<&FullItem>> = IndexMap::new();
      for item in old_items {
         old_buckets.entry(item.2.as_str()).or_default().push(item);
      }
      let mut new_buckets: IndexMap<&str, Vec<&FullItem>> = IndexMap::new();
      for item in new_items {
         new_buckets.entry(item.2.as_str()).or_default().push(item);
      }
      for (key, items) in &new_buckets {
         let old_count = old_buckets.shift_remove(key).map_or(0, |v| v.len());
         if items.len() > old_count {
            let extra = items.len() - old_count;
            added.entry(file.clone()).or_default().extend(items[..extra].iter().map(|i| (*i).clone()));
         } else if items.len() < old_count {
            // Count the disappearance; the old items carry the text.
            let gone = old_count - items.len();
            let old_items = old_items.iter().filter(|i| i.2 == **key).take(gone);
            removed.entry(file.clone()).or_default().extend(old_items.cloned());
         }
      }
      for (_, items) in old_buckets {
         removed.entry(file.clone()).or_default().extend(items.into_iter().cloned());
      }
   }
   for (file, new_items) in new {
      if !old.contains_key(file) {
         added.insert(file.clone(), new_items.clone());
      }
   }
   (removed, added)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn lines(text: &str) -> Vec<String> {
      text.lines().map(str::to_string).collect()
   }

   #[test]
   fn test_compiler_warning_with_flag() {
      let log = lines(
         "/s/src/kits/app/Message.cpp:100:5: warning: unused variable 'x' [-Wunused-variable]",
      );
      let analysis = analyse(&log);
      assert_eq!(analysis.warning_count(), 1);
      assert_eq!(analysis.error_count(), 0);
      let items = &analysis.warnings["src/kits/app/Message.cpp"];
      assert_eq!(items[0].0, 1);
      assert_eq!(items[0].1, 100);
      assert_eq!(analysis.message_table()[items[0].2], "unused-variable");
   }

   #[test]
   fn test_compiler_error_and_fatal() {
      let log = lines(
         "/s/src/a.cpp:1:2: error: expected ';' before '}' token\n\
          /s/src/b.cpp:3:4: fatal error: missing.h: No such file or directory",
      );
      let analysis = analyse(&log);
      assert_eq!(analysis.error_count(), 2);
      assert!(analysis.errors.contains_key("src/a.cpp"));
      assert!(analysis.errors.contains_key("src/b.cpp"));
   }

   #[test]
   fn test_inferred_family_when_flag_missing() {
      let log = lines("/s/src/a.c:10:2: warning: comparison between signed and unsigned");
      let analysis = analyse(&log);
      let items = &analysis.warnings["src/a.c"];
      assert_eq!(analysis.message_table()[items[0].2], "sign-compare");
   }

   #[test]
   fn test_jam_failure_yields_fail_and_error() {
      let log = lines("...failed updating 2 target(s)...");
      let analysis = analyse(&log);
      assert_eq!(analysis.failures, "...failed updating 2 target(s)...");
      assert_eq!(analysis.error_count(), 1);
      assert!(analysis.errors.contains_key("jambuild"));
   }

   #[test]
   fn test_package_lines_collected() {
      let log = lines("haiku_loader.hpkg: Creating the package ...");
      let analysis = analyse(&log);
      assert_eq!(analysis.packages, BTreeSet::from(["haiku_loader.hpkg".to_string()]));
   }

   #[test]
   fn test_unavailable_build_packages_fan_out() {
      let log = lines("build-feature packages unavailable: openssl zlib");
      let analysis = analyse(&log);
      assert_eq!(analysis.warning_count(), 2);
   }

   #[test]
   fn test_linker_and_timeout_lines() {
      let log = lines(
         "collect2: ld returned 1 exit status\nfailed: Connection timed out.",
      );
      let analysis = analyse(&log);
      assert_eq!(analysis.error_count(), 2);
      assert!(analysis.errors.contains_key("ld"));
      assert!(analysis.errors.contains_key("connection"));
   }

   #[test]
   fn test_loose_fallback_requires_known_family() {
      // Known family without severity word: classified.
      let log = lines("/s/src/a.c:5: unused variable 'y'");
      let analysis = analyse(&log);
      assert_eq!(analysis.warning_count(), 1);
      // Unknown message without severity word: dropped.
      let log = lines("/s/src/a.c:5: something unrecognizable here");
      let analysis = analyse(&log);
      assert_eq!(analysis.warning_count() + analysis.error_count(), 0);
   }

   #[test]
   fn test_loose_fallback_error_families() {
      let log = lines("/s/src/a.c:5: bar.h: No such file or directory");
      let analysis = analyse(&log);
      assert_eq!(analysis.error_count(), 1);
   }

   #[test]
   fn test_note_lines_skipped() {
      let log = lines("/s/src/a.c:5:1: note: declared here");
      let analysis = analyse(&log);
      assert_eq!(analysis.warning_count() + analysis.error_count(), 0);
   }

   #[test]
   fn test_interned_ids_are_insertion_ordered() {
      let log = lines(
         "/s/a.c:1:1: warning: unused variable 'a' [-Wunused-variable]\n\
          /s/b.c:2:1: warning: statement has no effect [-Wunused-value]\n\
          /s/c.c:3:1: warning: unused variable 'c' [-Wunused-variable]",
      );
      let analysis = analyse(&log);
      assert_eq!(analysis.message_table(), vec!["unused-variable", "unused-value"]);
      assert_eq!(analysis.warnings["c.c"][0].2, 0);
   }

   #[test]
   fn test_match_error_key_fallthrough() {
      assert_eq!(match_error_key("label 'out' defined but not used"), "unused-label");
      assert_eq!(match_error_key("'f(int)' defined but not used"), "unused-function");
      assert_eq!(match_error_key("'v' defined but not used"), "unused-variable");
      assert_eq!(match_error_key("too many arguments for format"), "format-extra-args");
      assert_eq!(match_error_key("too many arguments to function"), "extra-args");
      assert_eq!(match_error_key("completely novel text"), "completely novel text");
   }

   #[test]
   fn test_normpath() {
      assert_eq!(normpath("a/./b//c"), "a/b/c");
      assert_eq!(normpath("a/../b"), "b");
      assert_eq!(normpath("../a"), "../a");
      assert_eq!(normpath("/a/../../b"), "/b");
   }

   fn full(items: &[(&str, &[&str])]) -> FullMap {
      items
         .iter()
         .map(|(file, msgs)| {
            (
               file.to_string(),
               msgs
                  .iter()
                  .enumerate()
                  .map(|(i, m)| (i as u32 + 1, i as u32 + 10, m.to_string()))
                  .collect(),
            )
         })
         .collect()
   }

   #[test]
   fn test_diff_multiplicity() {
      let old = full(&[("a.c", &["m1", "m1", "m2"])]);
      let new = full(&[("a.c", &["m1", "m2", "m2", "m2"])]);
      let (removed, added) = diff(&old, &new);
      assert_eq!(removed["a.c"].len(), 1);
      assert_eq!(removed["a.c"][0].2, "m1");
      assert_eq!(added["a.c"].len(), 2);
      assert!(added["a.c"].iter().all(|i| i.2 == "m2"));
   }

   #[test]
   fn test_diff_file_only_on_one_side() {
      let old = full(&[("gone.c", &["m1"])]);
      let new = full(&[("fresh.c", &["m2"])]);
      let (removed, added) = diff(&old, &new);
      assert_eq!(removed["gone.c"].len(), 1);
      assert_eq!(added["fresh.c"].len(), 1);
   }

   #[test]
   fn test_diff_law_per_file() {
      // |added| - |removed| == |new| - |old| per file.
      let old = full(&[("a.c", &["m1", "m2", "m2", "m3"])]);
      let new = full(&[("a.c", &["m2", "m3", "m3", "m4", "m4"])]);
      let (removed, added) = diff(&old, &new);
      let removed_count = removed.get("a.c").map_or(0, Vec::len) as i64;
      let added_count = added.get("a.c").map_or(0, Vec::len) as i64;
      assert_eq!(added_count - removed_count, 5 - 4);
   }

   #[test]
   fn test_diff_identical_analyses_empty() {
      let old = full(&[("a.c", &["m1", "m2"])]);
      let (removed, added) = diff(&old, &old.clone());
      assert!(removed.is_empty());
      assert!(added.is_empty());
   }

   #[test]
   fn test_diff_added_follows_new_side_buckets() {
      let old = full(&[("a.c", &[])]);
      let new = full(&[("a.c", &["z", "a", "z"])]);
      let (_, added) = diff(&old, &new);
      // Buckets appear in new-side first-occurrence order, items within a
      // bucket keep their order.
      let msgs: Vec<&str> = added["a.c"].iter().map(|i| i.2.as_str()).collect();
      assert_eq!(msgs, vec!["z", "z", "a"]);
   }
}
