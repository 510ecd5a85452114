use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use thiserror::Error;

use crate::agent::AgentCommand;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("child handle already taken")]
    ChildTaken,
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A child process attached to the slave side of a fresh PTY.
///
/// Only the master side is kept; the slave is closed after spawn so the
/// reader sees EOF once the child (and anything it forked) lets go of it.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl Pty {
    pub fn build_command(cmd: &AgentCommand) -> CommandBuilder {
        let mut builder = CommandBuilder::new(&cmd.program);
        builder.args(&cmd.args);
        builder.cwd(&cmd.cwd);
        builder.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        for (k, v) in &cmd.env {
            builder.env(k, v);
        }
        builder
    }

    pub fn spawn(cmd: &AgentCommand, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let child = pair
            .slave
            .spawn_command(Self::build_command(cmd))
            .map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child so it can be waited on from a blocking task.
    pub fn take_child(&mut self) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        self.child.take().ok_or(PtyError::ChildTaken)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(PtyError::Resize)
    }
}
