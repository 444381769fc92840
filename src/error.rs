use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
   #[error("Git command failed: {0}")]
   GitError(String),

   #[error("Gerrit request failed (HTTP {status}): {body}")]
   ApiError { status: u16, body: String },

   #[error("Configuration error: {0}")]
   ConfigError(String),

   /// The backup file exists at startup: a previous save never completed and
   /// the primary document cannot be trusted.
   #[error("Broken store: {0}")]
   BrokenStore(String),

   #[error("Commit {commit} reports several Change-Ids")]
   MalformedCommit { commit: String },

   #[error("Build setup failed: {0}")]
   BuildError(String),

   /// Neither a rebase nor a cherry-pick abort got the repository out of its
   /// replay state.
   #[error("Unknown replay state in {0}")]
   ReplayState(String),

   #[error("IO error: {0}")]
   IoError(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   JsonError(#[from] serde_json::Error),

   #[error("HTTP error: {0}")]
   HttpError(#[from] reqwest::Error),

   #[error("Template error: {0}")]
   TemplateError(#[from] tera::Error),

   #[error("{0}")]
   Other(String),
}

pub type Result<T> = std::result::Result<T, BotError>;
