//! Name validation
//!
//! Peer, route and DNS mapping names end up inside DNS records, so they must
//! be valid DNS labels:
//! - 1-63 characters
//! - [a-z0-9-] only (input is lowercased first)
//! - No leading or trailing hyphens
//!
//! Group, policy and network names are free-form display names with a
//! length limit.

/// Name validation error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    Empty,
    TooLong { max: usize, got: usize },
    InvalidCharacter { position: usize, char: char },
    LeadingHyphen,
    TrailingHyphen,
    EmptyLabel,
}

impl std::fmt::Display for NameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Name cannot be empty"),
            Self::TooLong { max, got } => {
                write!(f, "Name must be at most {} characters (got {})", max, got)
            }
            Self::InvalidCharacter { position, char } => write!(
                f,
                "Invalid character '{}' at position {}. Only lowercase letters, numbers, and hyphens are allowed.",
                char, position
            ),
            Self::LeadingHyphen => write!(f, "Name cannot start with a hyphen"),
            Self::TrailingHyphen => write!(f, "Name cannot end with a hyphen"),
            Self::EmptyLabel => write!(f, "Domain cannot contain empty labels"),
        }
    }
}

impl std::error::Error for NameError {}

impl From<NameError> for crate::Error {
    fn from(e: NameError) -> Self {
        crate::Error::Validation(e.to_string())
    }
}

const MAX_LABEL_LEN: usize = 63;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Validate a DNS label, returning the normalized (lowercase) form
pub fn validate_label(name: &str) -> Result<String, NameError> {
    let name = name.trim().to_lowercase();
    let len = name.len();

    if len == 0 {
        return Err(NameError::Empty);
    }
    if len > MAX_LABEL_LEN {
        return Err(NameError::TooLong { max: MAX_LABEL_LEN, got: len });
    }

    for (i, c) in name.chars().enumerate() {
        if !matches!(c, 'a'..='z' | '0'..='9' | '-') {
            return Err(NameError::InvalidCharacter { position: i, char: c });
        }
    }

    if name.starts_with('-') {
        return Err(NameError::LeadingHyphen);
    }
    if name.ends_with('-') {
        return Err(NameError::TrailingHyphen);
    }

    Ok(name)
}

/// Validate a dotted domain suffix such as `corp.mesh`
pub fn validate_domain(domain: &str) -> Result<String, NameError> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() {
        return Err(NameError::Empty);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(NameError::TooLong { max: MAX_DOMAIN_LEN, got: domain.len() });
    }
    let mut labels = Vec::new();
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        labels.push(validate_label(label)?);
    }
    Ok(labels.join("."))
}

/// Validate a free-form display name (groups, policies, networks)
pub fn validate_display_name(name: &str) -> Result<String, NameError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    let len = name.chars().count();
    if len > MAX_DISPLAY_NAME_LEN {
        return Err(NameError::TooLong { max: MAX_DISPLAY_NAME_LEN, got: len });
    }
    Ok(name.to_string())
}
