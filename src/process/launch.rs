//! Shell and interpreter selection.
//!
//! Pure decision logic: given the OS family and what the session should
//! run, produce the command line to launch. Kept side-effect free so the
//! rest of the engine stays OS-agnostic.

use std::path::{Component, Path, PathBuf};

use crate::error::TermRelayError;
use crate::Result;

/// OS family the engine branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    /// Detect the host OS family.
    pub fn host() -> Self {
        if cfg!(windows) {
            OsFamily::Windows
        } else {
            OsFamily::Unix
        }
    }
}

/// A resolved command line ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl LaunchPlan {
    fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Plan for an interactive shell session.
pub fn interactive_shell(os: OsFamily) -> LaunchPlan {
    match os {
        OsFamily::Unix => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            LaunchPlan {
                program: shell,
                args: vec!["-i".to_string()],
            }
        }
        OsFamily::Windows => LaunchPlan::new("cmd.exe", &[]),
    }
}

/// Plan for running a specific script through the interpreter appropriate
/// for the OS and the script's extension.
pub fn script_command(os: OsFamily, script: &Path) -> LaunchPlan {
    let path = script.to_string_lossy().to_string();
    let ext = script
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match (os, ext.as_str()) {
        (OsFamily::Unix, "sh") => LaunchPlan {
            program: "/bin/sh".to_string(),
            args: vec![path],
        },
        (OsFamily::Unix, "py") => LaunchPlan {
            program: "python3".to_string(),
            args: vec![path],
        },
        (OsFamily::Unix, _) => LaunchPlan {
            program: path,
            args: vec![],
        },
        (OsFamily::Windows, "bat") | (OsFamily::Windows, "cmd") => LaunchPlan {
            program: "cmd.exe".to_string(),
            args: vec!["/C".to_string(), path],
        },
        (OsFamily::Windows, "ps1") => LaunchPlan {
            program: "powershell.exe".to_string(),
            args: vec!["-File".to_string(), path],
        },
        (OsFamily::Windows, "py") => LaunchPlan {
            program: "python".to_string(),
            args: vec![path],
        },
        (OsFamily::Windows, _) => LaunchPlan {
            program: path,
            args: vec![],
        },
    }
}

/// Resolve a script path against the configured base directory.
///
/// Rejects absolute paths and any parent-directory segment before the
/// filesystem is touched.
pub fn resolve_script(base_dir: &Path, script: &str) -> Result<PathBuf> {
    let requested = Path::new(script);

    if requested.is_absolute() {
        return Err(TermRelayError::PathTraversalRejected(script.to_string()));
    }

    for component in requested.components() {
        match component {
            Component::ParentDir => {
                return Err(TermRelayError::PathTraversalRejected(script.to_string()))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TermRelayError::PathTraversalRejected(script.to_string()))
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }

    Ok(base_dir.join(requested))
}
