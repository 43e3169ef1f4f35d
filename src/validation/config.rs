//! Configuration validation functions

use super::ValidationError;

/// Validate a repository name as used in requests and on the command line
pub fn validate_repository_name(name: &str) -> Result<(), ValidationError> {
	if name.is_empty() {
		return Err(ValidationError::ConfigError("Repository name must not be empty".to_string()));
	}
	if name.contains(|c: char| c == '/' || c == '\\' || c.is_control()) {
		return Err(ValidationError::ConfigError(format!(
			"Repository name {:?} contains invalid characters",
			name
		)));
	}
	Ok(())
}

/// Validate transaction idle timeout in seconds
pub fn validate_timeout_secs(timeout_secs: u64) -> Result<(), ValidationError> {
	if timeout_secs == 0 {
		return Err(ValidationError::ConfigError("Timeout must be greater than 0".to_string()));
	}
	if timeout_secs > 7 * 24 * 3600 {
		return Err(ValidationError::ConfigError(format!(
			"Timeout too large: {} seconds (max one week)",
			timeout_secs
		)));
	}
	Ok(())
}

/// Validate the reserved data directory name (a single path segment)
pub fn validate_reserved_name(name: &str) -> Result<(), ValidationError> {
	if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
		return Err(ValidationError::ConfigError(format!(
			"Reserved directory name {:?} must be a single path segment",
			name
		)));
	}
	Ok(())
}


// vim: ts=4
