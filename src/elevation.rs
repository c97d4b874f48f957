//! Privilege elevation for kernel tools
//!
//! The engine normally runs as root inside the host daemon. When it does not
//! (CLI use by an operator), only two binaries are ever elevated:
//!
//! - **nft**: managed table edits and listings
//! - **ip**: policy rule and route edits and listings
//!
//! # Elevation Strategy
//!
//! - **Root**: the tool is executed directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `PHANTOM_FW_ELEVATION_METHOD`: force `sudo`, `run0` or `pkexec`.
//! - `PHANTOM_FW_NO_ELEVATION`: bypass elevation entirely (tests, containers
//!   with `CAP_NET_ADMIN`).
//! - `PHANTOM_FW_NFT_COMMAND` / `PHANTOM_FW_IP_COMMAND`: path of the tool binary.
//!
//! # Security
//!
//! - Only the [`Tool`] variants can be elevated
//! - Arguments are passed as a vector, never through a shell
//! - Every argument is built from validated model values

use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PHANTOM_FW_ELEVATION_METHOD`
    #[error("Invalid PHANTOM_FW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Binaries that may be run with elevated privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Tool {
    #[strum(serialize = "nft")]
    Nft,
    #[strum(serialize = "ip")]
    Ip,
}

impl Tool {
    const fn override_var(self) -> &'static str {
        match self {
            Tool::Nft => "PHANTOM_FW_NFT_COMMAND",
            Tool::Ip => "PHANTOM_FW_IP_COMMAND",
        }
    }

    /// Program path, honoring the per-tool override variable
    pub fn program(self) -> String {
        std::env::var(self.override_var())
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.to_string())
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(launcher: &str, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(launcher);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a command for `tool`, elevated when the process is not root.
///
/// # Errors
///
/// Returns `Err` if `PHANTOM_FW_ELEVATION_METHOD` is invalid or names a
/// launcher that is not installed, or if no launcher is available.
pub fn create_elevated_command(tool: Tool, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let program = tool.program();

    if std::env::var("PHANTOM_FW_NO_ELEVATION").is_ok() {
        return Ok(direct(&program, args));
    }

    let forced = match std::env::var("PHANTOM_FW_ELEVATION_METHOD") {
        Ok(method) if !method.is_empty() => {
            let method = method.to_lowercase();
            if !matches!(method.as_str(), "sudo" | "run0" | "pkexec") {
                return Err(ElevationError::InvalidMethod(method));
            }
            Some(method)
        }
        _ => None,
    };

    if nix::unistd::getuid().is_root() {
        return Ok(direct(&program, args));
    }

    if let Some(method) = forced {
        if !binary_exists(&method) {
            return Err(ElevationError::MethodNotAvailable(method));
        }
        return Ok(wrapped(&method, &program, args));
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", &program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", &program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", &program, args))
    }
}
