//! Invocation of the jam build driver.

use std::path::Path;
use std::process::Command;

use crate::error::{BotError, Result};

/// jam build scripts read `$PWD`, which `Command` does not update when only
/// the working directory changes. Point it (and `$OLDPWD`) at the real cwd.
pub fn set_pwd_env(cmd: &mut Command, cwd: &Path) {
   if let Ok(pwd) = std::env::var("PWD") {
      cmd.env("OLDPWD", pwd);
   }
   let real = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
   cmd.env("PWD", real);
}

/// Run jam in `wd` against `target`, capturing stdout and stderr into
/// `output`. Returns whether jam exited cleanly; a non-zero exit is a build
/// outcome, not an error.
pub fn jam(
   wd: &Path,
   target: &str,
   options: &[String],
   max_jobs: usize,
   jam_cmd: &Path,
   output: &Path,
) -> Result<bool> {
   let mut cmd = Command::new(jam_cmd);
   let jobs = num_cpus::get().min(max_jobs);
   if jobs > 1 {
      cmd.arg(format!("-j{jobs}"));
   }
   cmd.args(options);
   cmd.arg(target);

   let out = std::fs::File::create(output)?;
   let err = out.try_clone()?;
   cmd.stdout(out).stderr(err).current_dir(wd);
   set_pwd_env(&mut cmd, wd);

   let status = cmd
      .status()
      .map_err(|e| BotError::BuildError(format!("failed to run {}: {e}", jam_cmd.display())))?;
   Ok(status.success())
}
