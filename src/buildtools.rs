//! Cross-compiler discovery under the buildtools tree.

use std::path::Path;

use crate::error::{BotError, Result};
use crate::paths::Paths;

/// Tool-name prefixes (`<bindir>/<triplet>-haiku-`) for an architecture.
/// The hybrid `x86_gcc2h` needs both legacy and modern toolchains. A missing
/// prefix is fatal: nothing can be built for the architecture.
pub fn arch_prefixes(paths: &Paths, arch: &str) -> Result<Vec<String>> {
   let bpath = paths.buildtools(arch);
   let triplets: &[&str] = if arch == "x86_gcc2h" { &["x86_gcc2", "x86"] } else { &[arch] };
   let mut prefixes = Vec::new();
   for triplet in triplets {
      let bin = bpath.join(format!("cross-tools-{triplet}")).join("bin");
      prefixes.push(find_tool_prefix(&bin).ok_or_else(|| {
         BotError::BuildError(format!(
            "could not find buildtools prefix for {arch} in {}",
            bin.display()
         ))
      })?);
   }
   Ok(prefixes)
}

/// A `<name>-haiku-` tool-name prefix shared by at least two binaries in the
/// directory; a single hit could be a stray file.
fn find_tool_prefix(bin: &Path) -> Option<String> {
   let mut seen: Vec<String> = Vec::new();
   for entry in std::fs::read_dir(bin).ok()?.flatten() {
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if let Some(pos) = name.find("-haiku-") {
         let tool_prefix = name[..pos + 7].to_string();
         if seen.contains(&tool_prefix) {
            return Some(bin.join(tool_prefix).to_string_lossy().into_owned());
         }
         seen.push(tool_prefix);
      }
   }
   None
}
