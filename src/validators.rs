//! Input validation and sanitization functions for phantom-fw
//!
//! Everything that ends up in an nft comment, an `ip` argument vector or a
//! store key passes through here first. Validators return `Err(String)` with a
//! human message; callers wrap it into [`crate::Error::Validation`].

/// Maximum length of a rule group name
pub const MAX_GROUP_NAME_LEN: usize = 48;

/// Validates a rule group name.
///
/// Group names are embedded in nft rule comments (`phantom/<prio>/<group>/<id>`),
/// so `/` and whitespace are rejected along with anything outside ASCII.
///
/// # Examples
///
/// ```
/// use phantom_fw::validators::validate_group_name;
///
/// assert!(validate_group_name("kill-switch").is_ok());
/// assert!(validate_group_name("bad/name").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or contains invalid characters.
pub fn validate_group_name(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Group name cannot be empty".to_string());
    }
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(format!(
            "Group name too long (max {MAX_GROUP_NAME_LEN} characters)"
        ));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err("Group name cannot start with '-' or '.'".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("Group name may only contain letters, digits, '-', '_' and '.'".to_string());
    }
    Ok(name)
}

/// Validates a free-form group type tag such as `vpn` or `kill_switch`.
///
/// # Errors
///
/// Returns `Err` if the tag is empty, longer than 32 bytes, or not `[a-z0-9_-]`.
pub fn validate_group_type(kind: &str) -> Result<&str, String> {
    if kind.is_empty() || kind.len() > 32 {
        return Err("Group type must be 1-32 characters".to_string());
    }
    if !kind
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
    {
        return Err("Group type may only contain lowercase letters, digits, '_' and '-'".to_string());
    }
    Ok(kind)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name)
}

/// Validates a routing table id.
///
/// 0 (`unspec`) and the reserved `local` table are not manageable.
///
/// # Errors
///
/// Returns `Err` for table 0 and 255.
pub fn validate_table_id(id: u32) -> Result<u32, String> {
    match id {
        0 => Err("Routing table id must be set (table 0 is unspec)".to_string()),
        255 => Err("Routing table 255 (local) is reserved by the kernel".to_string()),
        _ => Ok(id),
    }
}

/// Validates a policy rule priority.
///
/// Priority 0 belongs to the kernel's `local` lookup and 32766/32767 to the
/// `main`/`default` rules.
///
/// # Errors
///
/// Returns `Err` if the priority collides with a kernel default rule.
pub fn validate_rule_priority(priority: u32) -> Result<u32, String> {
    match priority {
        0 | 32766 | 32767 => Err(format!(
            "Policy priority {priority} is reserved by the kernel default rules"
        )),
        _ => Ok(priority),
    }
}

/// Parses an optional CIDR string, treating empty strings as absent.
///
/// `default` is accepted as the catch-all destination and returns `Ok(None)`.
///
/// # Errors
///
/// Returns `Err` if the text is not a valid address or network.
pub fn parse_optional_network(text: &str) -> Result<Option<ipnetwork::IpNetwork>, String> {
    let text = text.trim();
    if text.is_empty() || text == "default" {
        return Ok(None);
    }
    text.parse::<ipnetwork::IpNetwork>()
        .map(Some)
        .map_err(|e| format!("Invalid network '{text}': {e}"))
}

/// Parses an optional interface, treating empty strings as absent.
///
/// # Errors
///
/// Returns `Err` if the name fails [`validate_interface`].
pub fn parse_optional_interface(text: &str) -> Result<Option<String>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    validate_interface(text).map(|s| Some(s.to_string()))
}
