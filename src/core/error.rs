use thiserror::Error;

/// Numeric status codes carried across the C ABI.
///
/// Every [`Error`] maps to exactly one of these via [`Error::code`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    AlreadyInitialized = -1,
    NotInitialized = -2,
    NftFailed = -3,
    NetlinkFailed = -4,
    InvalidParam = -5,
    IoError = -6,
    PermissionDenied = -7,
    AlreadyStarted = -8,
    NotStarted = -9,
    InvalidState = -10,
    DbOpen = -11,
    DbQuery = -12,
    DbWrite = -13,
    GroupNotFound = -14,
    RuleNotFound = -15,
    AlreadyExists = -16,
    PresetFailed = -17,
    VerifyFailed = -18,
    InvalidHandle = -19,
}

impl ErrorCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Core error types for phantom-fw
#[derive(Debug, Error)]
pub enum Error {
    #[error("Engine is already initialized")]
    AlreadyInitialized,

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Engine is already started")]
    AlreadyStarted,

    #[error("Engine is not started")]
    NotStarted,

    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// The state store could not be opened or migrated
    #[error("Failed to open state store at {path}: {source}")]
    DbOpen {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("State store query failed ({context}): {source}")]
    DbQuery {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("State store write failed ({context}): {source}")]
    DbWrite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored row could not be decoded back into a model type
    #[error("Corrupt state store row: {0}")]
    Corrupt(String),

    #[error("Rule group '{0}' not found")]
    GroupNotFound(String),

    #[error("Firewall rule {0} not found")]
    RuleNotFound(i64),

    #[error("Routing rule {0} not found")]
    RouteNotFound(i64),

    #[error("Preset '{0}' is not applied")]
    PresetNotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// nftables rejected an operation
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// iproute2 rejected a policy or route operation
    #[error("routing error: {message}")]
    Netlink {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A compiled operation failed; everything applied before it was rolled back
    #[error("Kernel operation #{index} ({op}) failed: {source}")]
    Apply {
        index: usize,
        op: String,
        #[source]
        source: Box<Error>,
    },

    /// A preset expansion failed part-way and was rolled back
    #[error("Preset '{preset}' failed: {source}")]
    Preset {
        preset: String,
        #[source]
        source: Box<Error>,
    },

    /// The live kernel state could not be read back
    #[error("Verification failed: {0}")]
    Verify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Elevation error: {0}")]
    Elevation(String),

    #[error("Invalid or stale engine handle")]
    InvalidHandle,

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Maps the error onto the ABI taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyStarted => ErrorCode::AlreadyStarted,
            Self::NotStarted => ErrorCode::NotStarted,
            Self::InvalidState(_) | Self::Internal(_) => ErrorCode::InvalidState,
            Self::DbOpen { .. } => ErrorCode::DbOpen,
            Self::DbQuery { .. } | Self::Corrupt(_) => ErrorCode::DbQuery,
            Self::DbWrite { .. } => ErrorCode::DbWrite,
            Self::GroupNotFound(_) | Self::PresetNotFound(_) => ErrorCode::GroupNotFound,
            Self::RuleNotFound(_) | Self::RouteNotFound(_) => ErrorCode::RuleNotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Validation { .. } | Self::Serialization(_) => ErrorCode::InvalidParam,
            Self::Nftables { .. } => ErrorCode::NftFailed,
            Self::Netlink { .. } => ErrorCode::NetlinkFailed,
            Self::PermissionDenied(_) | Self::Elevation(_) => ErrorCode::PermissionDenied,
            Self::Apply { source, .. } => source.code(),
            Self::Preset { .. } => ErrorCode::PresetFailed,
            Self::Verify(_) => ErrorCode::VerifyFailed,
            Self::Io(_) => ErrorCode::IoError,
            Self::InvalidHandle => ErrorCode::InvalidHandle,
        }
    }

    /// Returns true for failures reported by the kernel side (nft, ip, sysctl).
    pub fn is_kernel(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NftFailed
                | ErrorCode::NetlinkFailed
                | ErrorCode::PermissionDenied
                | ErrorCode::IoError
        )
    }

    /// Builds a kernel error from failed `nft` output, classifying permission problems.
    pub fn from_nft_stderr(stderr: &str, exit_code: Option<i32>) -> Self {
        let translation = KernelErrorPattern::match_error(stderr);
        if translation.permission {
            return Self::PermissionDenied(translation.user_message);
        }
        Self::Nftables {
            message: first_line(stderr),
            stderr: Some(stderr.to_string()),
            exit_code,
        }
    }

    /// Builds a kernel error from failed `ip` output, classifying permission problems.
    pub fn from_ip_stderr(stderr: &str, exit_code: Option<i32>) -> Self {
        let translation = KernelErrorPattern::match_error(stderr);
        if translation.permission {
            return Self::PermissionDenied(translation.user_message);
        }
        Self::Netlink {
            message: first_line(stderr),
            stderr: Some(stderr.to_string()),
            exit_code,
        }
    }
}

fn first_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("command failed")
        .trim_start_matches("Error: ")
        .to_string()
}

/// Attaches store context to rusqlite results.
pub(crate) trait StoreResultExt<T> {
    fn query_ctx(self, context: &'static str) -> Result<T>;
    fn write_ctx(self, context: &'static str) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn query_ctx(self, context: &'static str) -> Result<T> {
        self.map_err(|source| Error::DbQuery { context, source })
    }

    fn write_ctx(self, context: &'static str) -> Result<T> {
        self.map_err(|source| Error::DbWrite { context, source })
    }
}

/// Represents a translated kernel error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub permission: bool,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            permission: false,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    fn permission(mut self) -> Self {
        self.permission = true;
        self
    }
}

/// Known nft/ip error patterns and their translations
pub struct KernelErrorPattern;

impl KernelErrorPattern {
    /// Matches stderr from nft or ip against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("cache initialization failed")
        {
            return ErrorTranslation::new("Insufficient privileges to modify kernel state")
                .with_suggestion("Run as root or grant CAP_NET_ADMIN")
                .with_suggestion("Or set PHANTOM_FW_ELEVATION_METHOD=sudo")
                .permission();
        }

        if lower.contains("command not found") || lower.contains("failed to spawn") {
            return ErrorTranslation::new("nft or ip binary is not installed or not in PATH")
                .with_suggestion("Install nftables and iproute2")
                .with_suggestion("Or point PHANTOM_FW_NFT_COMMAND / PHANTOM_FW_IP_COMMAND at them");
        }

        if lower.contains("file exists") {
            return ErrorTranslation::new("An identical rule or route is already installed")
                .with_suggestion("Run verify to inspect drift between store and kernel");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nftables rejected the rule")
                .with_suggestion("Ports require tcp or udp as protocol")
                .with_suggestion("Address family must match source/destination");
        }

        if lower.contains("cannot find device") {
            return ErrorTranslation::new("Network device does not exist")
                .with_suggestion("Bring the interface up before enabling the group");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Managed nftables table does not exist")
                .with_suggestion("Initialize or start the engine to create it");
        }

        if lower.contains("invalid") && (lower.contains("prefix") || lower.contains("address")) {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use CIDR notation such as 10.0.0.0/24 or fd00::/64");
        }

        ErrorTranslation::new(msg.trim())
    }

    /// Whether stderr says the object to delete is not there.
    ///
    /// Deletions treat this as success.
    pub fn is_absent(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        lower.contains("no such file or directory")
            || lower.contains("no such process")
            || lower.contains("does not exist")
            || lower.contains("not found")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
