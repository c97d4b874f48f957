//! Directory layout helpers
//!
//! Follows the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/phantom-fw/` - config and the default state database
//! - State: `~/.local/state/phantom-fw/` - log file and audit log
//!
//! When running as root these resolve under `/root`, which is what a system
//! service wants anyway.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// File name of the default state database
pub const DB_FILE_NAME: &str = "phantom-fw.db";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "phantom-fw", "phantom-fw")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// `<data_dir>/phantom-fw.db`, if a home directory can be determined
pub fn default_db_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(DB_FILE_NAME))
}

/// Creates the data and state directories with mode 0700.
pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Truncates a string to at most `max_len` bytes, appending an ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
