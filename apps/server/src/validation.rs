use validator::ValidationError;

pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Session and user ids: ASCII alphanumerics plus `_ - . :`.
pub fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::new("identifier_length"));
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(ValidationError::new("identifier_chars"));
    }

    Ok(())
}

/// Trims a handshake parameter; blank counts as absent.
pub fn normalize_param(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation_allows_expected_chars() {
        assert!(validate_identifier("text_session_42").is_ok());
        assert!(validate_identifier("appt-7.call:2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad id").is_err());
        assert!(validate_identifier("bad/id").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn blank_params_are_absent() {
        assert_eq!(normalize_param(Some("  S1 ".to_string())), Some("S1".to_string()));
        assert_eq!(normalize_param(Some("   ".to_string())), None);
        assert_eq!(normalize_param(None), None);
    }
}
