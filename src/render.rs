//! HTML rendering of analyzed build logs.
//!
//! The original log is published as an annotated `<ol>` with per-line
//! anchors; warnings and errors get css classes, source references become
//! links into the code browser, and a lead block carries counts, deltas and
//! the failure summary.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::log_analysis::{FullMap, MsgItem};

// /s/<file>:<line>:<col> references in transformed logs
static RE_SRCFILE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"/s/(?P<file>.*?)[:,\s$](?:(?P<line>\d+)[:,\s$])?(?:\d+[:,\s$])?").unwrap()
});
static RE_NOTICE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"(?i)\b(warning|(?:fatal )error|error)\s*:.*").unwrap());
// Should be good enough for this
static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+://[\w\./-]*\b").unwrap());
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

const PKG_SUFFIX: &str = ": Creating the package ...";

const PAGE_TEMPLATE: &str = "<!DOCTYPE html>\n<html><head>\
<meta charset=\"utf-8\" />\n<title>{{ title }}</title>\n\
<link rel=\"stylesheet\" href=\"{{ css }}\" />\n</head><body>\n\
{{ lead }}{{ sections }}\n<h2>Log</h2>{{ body }}\n</body></html>";

/// Escape text for HTML element and attribute content. Unlike tera's
/// autoescaper this leaves `/` alone, so path and URL patterns still match
/// in the escaped line.
pub fn escape_html(s: &str) -> String {
   let mut out = String::with_capacity(s.len());
   for c in s.chars() {
      match c {
         '&' => out.push_str("&amp;"),
         '<' => out.push_str("&lt;"),
         '>' => out.push_str("&gt;"),
         '"' => out.push_str("&quot;"),
         '\'' => out.push_str("&#x27;"),
         _ => out.push(c),
      }
   }
   out
}

/// Builds links from a source reference to the matching code-browser page.
pub enum FileLinker {
   Release { commit: String },
   Change { gerrit_url: String, project: String, number: u64, version: u32 },
}

impl FileLinker {
   pub fn link(&self, path: &str, line: Option<&str>) -> String {
      match self {
         Self::Release { commit } => {
            let mut url = format!("https://git.haiku-os.org/haiku/tree/{path}?id={commit}");
            if let Some(line) = line {
               url.push_str(&format!("#n{line}"));
            }
            url
         }
         Self::Change { gerrit_url, project, number, version } => {
            let mut url = format!("{gerrit_url}/c/{project}/+/{number}/{version}/{path}");
            if let Some(line) = line {
               url.push_str(&format!("#{line}"));
            }
            url
         }
      }
   }
}

/// One published log page; holds everything the closures of the build
/// pipeline used to capture.
pub struct LogPage<'a> {
   pub title: &'a str,
   pub css: String,
   pub warnings: u32,
   pub errors: u32,
   /// `(warning delta, error delta, parent tag)` when a baseline exists.
   pub deltas: Option<(i64, i64, &'a str)>,
   pub failures: &'a str,
   pub new_messages: Option<&'a FullMap>,
   pub error_index: &'a BTreeMap<String, Vec<MsgItem>>,
   pub message_table: Vec<&'a str>,
   pub linker: &'a FileLinker,
}

impl LogPage<'_> {
   fn lead(&self) -> String {
      let mut warn_delta = String::new();
      let mut err_delta = String::new();
      let mut vs = String::new();
      if let Some((dw, de, parent)) = &self.deltas {
         if *dw != 0 {
            warn_delta = format!(" ({dw:+})");
         }
         if *de != 0 {
            err_delta = format!(" ({de:+})");
         }
         if *dw != 0 || *de != 0 {
            vs = format!("<br>\n(vs {})", escape_html(parent));
         }
      }
      format!(
         "<h1>{}</h1>\n<p>{}{} warnings<br>\n{}{} errors{}</p>\n<pre>{}</pre>\n",
         escape_html(self.title),
         self.warnings,
         warn_delta,
         self.errors,
         err_delta,
         vs,
         escape_html(self.failures)
      )
   }

   fn msg_item(&self, out: &mut String, file: &str, src_line: u32, log_line: u32, msg: &str) {
      if src_line != 0 {
         out.push_str(&format!(
            " <li><samp><a href=\"{}\">{}:{}</a>: ",
            self.linker.link(file, Some(&src_line.to_string())),
            escape_html(file),
            src_line
         ));
      } else {
         out.push_str(&format!(" <li><samp>{}: ", escape_html(file)));
      }
      out.push_str(&format!(
         "<a href=\"#n{}\">{}</a></samp></li>\n",
         log_line,
         escape_html(msg)
      ));
   }

   fn sections(&self) -> String {
      let mut out = String::new();
      if let Some(new_msgs) = self.new_messages {
         if !new_msgs.is_empty() {
            out.push_str("<h2>New messages</h2>\n<ul>\n");
            for (file, msgs) in new_msgs {
               for (log_line, src_line, msg) in msgs {
                  self.msg_item(&mut out, file, *src_line, *log_line, msg);
               }
            }
            out.push_str("</ul>\n");
         }
      }
      if !self.error_index.is_empty() {
         out.push_str("\n<h2>Errors</h2>\n<ul>\n");
         for (file, msgs) in self.error_index {
            for (log_line, src_line, id) in msgs {
               let msg = self.message_table.get(*id).copied().unwrap_or("");
               self.msg_item(&mut out, file, *src_line, *log_line, msg);
            }
         }
         out.push_str("</ul>\n");
      }
      out
   }

   /// Render the whole page to `dst`. `line_classes` is indexed by log line
   /// (1-based): 0 plain, 1 warning, 2 error.
   pub fn write<S: AsRef<str>>(&self, dst: &Path, log: &[S], line_classes: &[u8]) -> Result<()> {
      let mut body = String::from("\n<pre><ol class=\"log\">");
      for (idx, line) in log.iter().enumerate() {
         let lineno = idx + 1;
         let class = line_classes.get(lineno).copied().unwrap_or(0);
         body.push_str(&annotate_line(line.as_ref(), lineno, class, self.linker));
      }
      body.push_str("\n</ol></pre>");

      let mut context = tera::Context::new();
      context.insert("title", &escape_html(self.title));
      context.insert("css", &self.css);
      context.insert("lead", &self.lead());
      context.insert("sections", &self.sections());
      context.insert("body", &body);
      let page = tera::Tera::one_off(PAGE_TEMPLATE, &context, false)?;

      let mut file = std::fs::File::create(dst)?;
      file.write_all(page.as_bytes())?;
      Ok(())
   }
}

fn annotate_line(line: &str, lineno: usize, class: u8, linker: &FileLinker) -> String {
   let mut line = escape_html(line);
   if let Some(pkg) = line.strip_suffix(PKG_SUFFIX) {
      line = format!("<a href=\"{pkg}\" class=\"pkg\">{pkg}</a>{PKG_SUFFIX}");
   } else {
      line = RE_URL.replace_all(&line, "<a href=\"$0\">$0</a>").into_owned();
   }

   let mut samp_class = match class {
      1 => Some("warning"),
      2 => Some("error"),
      _ => None,
   };
   if samp_class.is_some() {
      let marked = RE_NOTICE
         .replace(&line, |caps: &regex::Captures| {
            format!("<span class=\"{}\">{}</span>", caps[1].to_lowercase(), &caps[0])
         })
         .into_owned();
      if marked != line && !marked.starts_with("<span class") {
         samp_class = None;
         line = marked;
      }
   }

   let line = RE_SRCFILE
      .replace_all(&line, |caps: &regex::Captures| {
         let file = &caps["file"];
         let src_line = caps.name("line").map(|m| m.as_str());
         format!("<a href=\"{}\">{}</a>", linker.link(file, src_line), &caps[0])
      })
      .into_owned();

   match samp_class {
      Some(class) => {
         format!("\n<li><samp id=\"n{lineno}\" class=\"{class}\">{line}</samp>")
      }
      None => format!("\n<li><samp id=\"n{lineno}\">{line}</samp>"),
   }
}

/// Drop markup from a published log line; used to recover the raw log from
/// `buildlog.html` when re-extracting.
pub fn strip_html(line: &str) -> String {
   unescape_html(&RE_TAG.replace_all(line, ""))
}

pub fn unescape_html(s: &str) -> String {
   s.replace("&lt;", "<")
      .replace("&gt;", ">")
      .replace("&quot;", "\"")
      .replace("&#x27;", "'")
      .replace("&#39;", "'")
      .replace("&#x2F;", "/")
      .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
   use super::*;

   fn release_linker() -> FileLinker {
      FileLinker::Release { commit: "deadbeef".to_string() }
   }

   #[test]
   fn test_release_link() {
      let linker = release_linker();
      assert_eq!(
         linker.link("src/a.cpp", Some("10")),
         "https://git.haiku-os.org/haiku/tree/src/a.cpp?id=deadbeef#n10"
      );
      assert_eq!(
         linker.link("src/a.cpp", None),
         "https://git.haiku-os.org/haiku/tree/src/a.cpp?id=deadbeef"
      );
   }

   #[test]
   fn test_change_link() {
      let linker = FileLinker::Change {
         gerrit_url: "https://review.haiku-os.org".to_string(),
         project: "haiku".to_string(),
         number: 7000,
         version: 2,
      };
      assert_eq!(
         linker.link("src/a.cpp", Some("10")),
         "https://review.haiku-os.org/c/haiku/+/7000/2/src/a.cpp#10"
      );
   }

   #[test]
   fn test_annotate_plain_line_is_escaped_and_anchored() {
      let line = annotate_line("a < b", 3, 0, &release_linker());
      assert_eq!(line, "\n<li><samp id=\"n3\">a &lt; b</samp>");
   }

   #[test]
   fn test_annotate_warning_line_gets_span() {
      let line = annotate_line("/x.cpp:1:2: warning: bad", 1, 1, &release_linker());
      assert!(line.contains("<span class=\"warning\">"));
      // The span swallowed the notice, so the samp itself stays unclassed.
      assert!(!line.contains("samp id=\"n1\" class"));
   }

   #[test]
   fn test_annotate_source_reference_linked() {
      let line = annotate_line("/s/src/a.cpp:10:2: warning: x", 1, 0, &release_linker());
      assert!(line.contains("href=\"https://git.haiku-os.org/haiku/tree/src/a.cpp?id=deadbeef#n10\""));
   }

   #[test]
   fn test_annotate_package_line_linked() {
      let line = annotate_line("x.hpkg: Creating the package ...", 1, 0, &release_linker());
      assert!(line.contains("<a href=\"x.hpkg\" class=\"pkg\">x.hpkg</a>"));
   }

   #[test]
   fn test_annotate_url_autolink() {
      let line = annotate_line("see https://example.org/page", 1, 0, &release_linker());
      assert!(line.contains("<a href=\"https://example.org/page\">"));
   }

   #[test]
   fn test_strip_html_roundtrip() {
      let raw = "/s/src/a.cpp:10:2: warning: a < b";
      let annotated = annotate_line(raw, 1, 1, &release_linker());
      let line = annotated.strip_prefix('\n').unwrap();
      assert_eq!(strip_html(line), raw);
   }
}
