//! HTTPS JSON client for the Gerrit-style review server.
//!
//! Change listings are cached per branch and refreshed incrementally with
//! `since:` queries; pages are walked with `before:` while the server reports
//! `_more_changes`.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{BotError, Result};
use crate::store::{ChangeRecord, ChangeTimes, SentReview, TAG_UNRESOLVED, TAG_WIP};

static RE_WIP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWIP\b").unwrap());

/// Strip Gerrit's XSSI protection prefix and parse the JSON payload.
pub fn extract_json(text: &str) -> Result<Value> {
   let text = text.strip_prefix(")]}'").unwrap_or(text);
   Ok(serde_json::from_str(text)?)
}

/// Percent-encode everything outside the unreserved set (Gerrit project and
/// ref ids go into path segments).
pub fn url_encode(s: &str) -> String {
   let mut out = String::with_capacity(s.len());
   for byte in s.bytes() {
      match byte {
         b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
            out.push(byte as char);
         }
         _ => out.push_str(&format!("%{byte:02X}")),
      }
   }
   out
}

/// Gerrit timestamps are UTC `yyyy-mm-dd hh:mm:ss.fffffffff`.
pub fn timestamp_to_time(s: &str) -> i64 {
   if s.len() < 19 {
      return 0;
   }
   chrono::NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%d %H:%M:%S")
      .map(|t| t.and_utc().timestamp())
      .unwrap_or(0)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeInfo {
   pub change_id: String,
   #[serde(rename = "_number")]
   pub number: u64,
   pub subject: String,
   pub status: String,
   #[serde(default)]
   pub branch: String,
   pub created: String,
   pub updated: String,
   #[serde(default)]
   pub current_revision: String,
   #[serde(default)]
   pub revisions: BTreeMap<String, RevisionInfo>,
   #[serde(default)]
   pub hashtags: Vec<String>,
   #[serde(default)]
   pub topic: Option<String>,
   #[serde(default)]
   pub work_in_progress: bool,
   #[serde(default)]
   pub unresolved_comment_count: u32,
   #[serde(default)]
   pub labels: BTreeMap<String, LabelInfo>,
   #[serde(rename = "_more_changes", default)]
   pub more_changes: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionInfo {
   #[serde(rename = "_number")]
   pub number: u32,
   #[serde(rename = "ref")]
   pub ref_name: String,
   #[serde(default)]
   pub created: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelInfo {
   #[serde(default)]
   pub approved: Option<Value>,
   #[serde(default)]
   pub rejected: Option<Value>,
   #[serde(default)]
   pub recommended: Option<Value>,
   #[serde(default)]
   pub disliked: Option<Value>,
}

impl ChangeInfo {
   pub fn current_revision_info(&self) -> Option<&RevisionInfo> {
      self.revisions.get(&self.current_revision)
   }

   /// Verified label state as the score string it implies: "+1", "-1" or "".
   pub fn verified_score(&self) -> &'static str {
      match self.labels.get("Verified") {
         Some(label) if label.approved.is_some() => "+1",
         Some(label) if label.rejected.is_some() => "-1",
         _ => "",
      }
   }
}

/// Review comment posted back to the server.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewInput {
   pub message: String,
   pub tag: String,
   pub labels: BTreeMap<String, i32>,
   pub notify: String,
   pub omit_duplicate_comments: bool,
}

impl ReviewInput {
   pub fn new(message: String, verified: i32) -> Self {
      Self {
         message,
         tag: "autogenerated:buildbot".to_string(),
         labels: BTreeMap::from([("Verified".to_string(), verified)]),
         notify: "NONE".to_string(),
         omit_duplicate_comments: true,
      }
   }
}

pub struct GerritClient {
   client: reqwest::blocking::Client,
   base_url: String,
   auth: Option<(String, String)>,
}

impl GerritClient {
   pub fn new(base_url: &str, auth: Option<(String, String)>) -> Result<Self> {
      let client = reqwest::blocking::Client::builder()
         .timeout(Duration::from_secs(120))
         .connect_timeout(Duration::from_secs(30))
         .build()?;
      Ok(Self {
         client,
         base_url: base_url.trim_end_matches('/').to_string(),
         auth,
      })
   }

   pub fn base_url(&self) -> &str {
      &self.base_url
   }

   pub fn has_auth(&self) -> bool {
      self.auth.is_some()
   }

   /// Anonymous clone URL for a project.
   pub fn project_url(&self, project: &str) -> String {
      format!("{}/{}", self.base_url, project)
   }

   fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
      let url = format!("{}/{}", self.base_url, path);
      let response = self
         .client
         .get(&url)
         .header("Accept", "application/json")
         .query(query)
         .send()?;
      let status = response.status();
      let body = response.text()?;
      if !status.is_success() {
         return Err(BotError::ApiError { status: status.as_u16(), body });
      }
      extract_json(&body)
   }

   pub fn project_info(&self, project: &str) -> Result<Value> {
      self.get(&format!("projects/{}", url_encode(project)), &[("pp", "0")])
   }

   pub fn branch_revision(&self, project: &str, branch_ref: &str) -> Result<String> {
      let value = self.get(
         &format!("projects/{}/branches/{}", url_encode(project), url_encode(branch_ref)),
         &[("pp", "0")],
      )?;
      value
         .get("revision")
         .and_then(Value::as_str)
         .map(str::to_string)
         .ok_or_else(|| BotError::Other(format!("no revision for branch {branch_ref}")))
   }

   /// POST a review to a revision; requires credentials.
   pub fn post_review(&self, change_id: &str, revision: &str, review: &ReviewInput) -> Result<Value> {
      let Some((user, password)) = &self.auth else {
         return Err(BotError::Other("review posting requires credentials".to_string()));
      };
      let url = format!("{}/a/changes/{}/revisions/{}/review", self.base_url, change_id, revision);
      let response = self
         .client
         .post(&url)
         .basic_auth(user, Some(password))
         .json(review)
         .send()?;
      let status = response.status();
      let body = response.text()?;
      if !status.is_success() {
         return Err(BotError::ApiError { status: status.as_u16(), body });
      }
      extract_json(&body)
   }
}

/// Cached view of the open changes targeting one branch.
pub struct GerritBranch {
   client: GerritClient,
   project: String,
   branch: String,
   cache_age: Duration,
   last_refresh: Option<Instant>,
   changes: BTreeMap<String, ChangeInfo>,
}

impl GerritBranch {
   pub fn new(client: GerritClient, project: &str, branch: &str, cache_secs: u64) -> Self {
      Self {
         client,
         project: project.to_string(),
         branch: branch.to_string(),
         cache_age: Duration::from_secs(cache_secs),
         last_refresh: None,
         changes: BTreeMap::new(),
      }
   }

   pub fn client(&self) -> &GerritClient {
      &self.client
   }

   fn update_changes(&mut self) -> Result<()> {
      if let Some(last) = self.last_refresh {
         if last.elapsed() < self.cache_age {
            return Ok(());
         }
      }

      let mut query = format!("project:\"{}\" branch:\"{}\"", self.project, self.branch);
      if self.changes.is_empty() {
         query.push_str(" is:open");
      } else {
         // Incremental refresh: only changes touched since the newest we hold.
         let since = self.changes.values().map(|c| c.updated.as_str()).max().unwrap_or("");
         query.push_str(&format!(" since:\"{since}\""));
      }

      let mut before: Option<String> = None;
      loop {
         let mut q = query.clone();
         if let Some(before) = &before {
            q.push_str(&format!(" before:\"{before}\""));
         }
         let value = self.client.get("changes/", &[
            ("q", q.as_str()),
            ("pp", "0"),
            ("o", "CURRENT_REVISION"),
            ("o", "SKIP_MERGEABLE"),
            ("o", "LABELS"),
         ])?;
         let page: Vec<ChangeInfo> = serde_json::from_value(value)?;
         if page.is_empty() {
            break;
         }
         let more = page.last().is_some_and(|c| c.more_changes);
         before = page.last().map(|c| c.updated.clone());
         for change in page {
            if change.status == "NEW" {
               self.changes.insert(change.change_id.clone(), change);
            } else {
               // Merged or abandoned; it won't show its update time again.
               self.changes.remove(&change.change_id);
            }
         }
         if !more {
            break;
         }
      }

      debug!(open = self.changes.len(), "refreshed change list");
      self.last_refresh = Some(Instant::now());
      Ok(())
   }

   pub fn get_changes(&mut self) -> Result<&BTreeMap<String, ChangeInfo>> {
      self.update_changes()?;
      Ok(&self.changes)
   }

   pub fn get_change(&mut self, cid: &str) -> Result<Option<&ChangeInfo>> {
      self.update_changes()?;
      Ok(self.changes.get(cid))
   }
}

/// Convert a server-side change into the record the store keeps, synthesizing
/// the WIP and unresolved-comments tags and the numeric review score.
pub fn change_record(info: &ChangeInfo) -> Result<ChangeRecord> {
   let rev = info
      .current_revision_info()
      .ok_or_else(|| BotError::Other(format!("change {} has no current revision", info.change_id)))?;

   let mut tags: std::collections::BTreeSet<String> =
      info.hashtags.iter().cloned().collect();
   if let Some(topic) = &info.topic {
      tags.insert(topic.clone());
   }
   if info.work_in_progress {
      tags.insert(TAG_WIP.to_string());
   }
   for alias in ["wip", "Wip"] {
      if tags.remove(alias) {
         tags.insert(TAG_WIP.to_string());
      }
   }
   let title_lower = info.subject.to_lowercase();
   if RE_WIP.is_match(&info.subject)
      || title_lower.contains("needs work")
      || title_lower.contains("work in progress")
   {
      tags.insert(TAG_WIP.to_string());
   }
   if info.unresolved_comment_count > 0 {
      tags.insert(TAG_UNRESOLVED.to_string());
   }

   let review = info.labels.get("Code-Review").map_or(0, |label| {
      if label.rejected.is_some() {
         -2
      } else if label.approved.is_some() {
         2
      } else if label.disliked.is_some() {
         -1
      } else if label.recommended.is_some() {
         1
      } else {
         0
      }
   });

   Ok(ChangeRecord {
      id: info.number,
      title: info.subject.clone(),
      version: rev.number,
      ref_name: rev.ref_name.clone(),
      time: ChangeTimes {
         create: timestamp_to_time(&info.created),
         version: timestamp_to_time(&rev.created),
         update: timestamp_to_time(&info.updated),
      },
      tags,
      review,
      sent_review: SentReview::default(),
      build: Vec::new(),
      lastbuild: None,
   })
}
