//! Agent profiles and structured command construction.
//!
//! A profile describes how to run one agent CLI. Commands are assembled as
//! a program plus a list of arguments; templates may contain `{token}`,
//! which is replaced inside a single argument and never re-split, so a
//! token can not smuggle extra arguments or shell syntax.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::LaunchMode;

const TOKEN_PLACEHOLDER: &str = "{token}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    /// Binary to execute (looked up on `PATH` when not absolute).
    pub program: String,
    /// Arguments passed on every launch.
    pub args: Vec<String>,
    /// Extra arguments for a fresh start.
    pub fresh_args: Vec<String>,
    /// Extra arguments when resuming with a stored token.
    pub resume_args: Vec<String>,
    /// Full argument list for the resume validation probe. Empty disables
    /// validation: a stored token is resumed directly.
    pub validate_args: Vec<String>,
    /// Extra arguments while the session's yolo flag is on.
    pub yolo_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// File (relative to the working directory) the agent writes its
    /// current resume token to. Re-read after every exit.
    pub token_file: Option<PathBuf>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            fresh_args: vec!["--session-id".into(), TOKEN_PLACEHOLDER.into()],
            resume_args: vec!["--resume".into(), TOKEN_PLACEHOLDER.into()],
            validate_args: vec![
                "--resume".into(),
                TOKEN_PLACEHOLDER.into(),
                "--print".into(),
                "--max-turns".into(),
                "1".into(),
                "/status".into(),
            ],
            yolo_args: vec!["--dangerously-skip-permissions".into()],
            env: BTreeMap::new(),
            token_file: None,
        }
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Token this invocation starts or resumes.
    pub resume_token: String,
}

fn expand<'a>(templates: &'a [String], token: &str) -> impl Iterator<Item = String> + 'a {
    let token = token.to_string();
    templates.iter().map(move |t| t.replace(TOKEN_PLACEHOLDER, &token))
}

impl AgentProfile {
    pub fn can_validate(&self) -> bool {
        !self.validate_args.is_empty()
    }

    /// Build the interactive launch command.
    pub fn launch_command(&self, mode: LaunchMode, token: &str, cwd: &Path, yolo: bool) -> AgentCommand {
        let mode_args = match mode {
            LaunchMode::Fresh => &self.fresh_args,
            LaunchMode::Resume => &self.resume_args,
        };
        let mut args: Vec<String> = expand(&self.args, token).collect();
        args.extend(expand(mode_args, token));
        if yolo {
            args.extend(expand(&self.yolo_args, token));
        }
        AgentCommand {
            program: self.program.clone(),
            args,
            cwd: cwd.to_path_buf(),
            env: self.env_pairs(),
            resume_token: token.to_string(),
        }
    }

    /// Build the bounded validation probe for `token`, if configured.
    pub fn validation_command(&self, token: &str, cwd: &Path) -> Option<AgentCommand> {
        if !self.can_validate() {
            return None;
        }
        Some(AgentCommand {
            program: self.program.clone(),
            args: expand(&self.validate_args, token).collect(),
            cwd: cwd.to_path_buf(),
            env: self.env_pairs(),
            resume_token: token.to_string(),
        })
    }

    /// Read the agent-written token file, if any.
    pub async fn read_token_file(&self, cwd: &Path) -> Option<String> {
        let path = cwd.join(self.token_file.as_ref()?);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => {
                let token = s.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no agent token file");
                None
            }
        }
    }

    fn env_pairs(&self) -> Vec<(String, String)> {
        self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Generate a fresh resume token.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
