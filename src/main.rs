use std::process::ExitCode;

use buildbot::config::BotConfig;
use buildbot::error::BotError;
use buildbot::orchestrator::Orchestrator;
use tracing_subscriber::EnvFilter;

fn run() -> buildbot::Result<()> {
   let config = BotConfig::load()?;
   Orchestrator::new(config)?.run()
}

fn main() -> ExitCode {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
      .init();

   match run() {
      Ok(()) => ExitCode::SUCCESS,
      Err(err @ BotError::BrokenStore(_)) => {
         eprintln!("{err}");
         ExitCode::from(2)
      }
      Err(err) => {
         eprintln!("{err}");
         ExitCode::FAILURE
      }
   }
}
