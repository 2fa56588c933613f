//! Local input validation
//!
//! Runs before any network call. Failures are [`SessionError::Validation`]
//! and are never retried.

use sessiond_error::SessionError;
use sessiond_traits::{Credentials, SignUpRequest};

/// Minimum password length accepted at sign-up
pub const MIN_PASSWORD_LEN: usize = 6;
/// Maximum password length (bcrypt input limit)
pub const MAX_PASSWORD_LEN: usize = 72;
/// Maximum display name length
pub const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Trim and lowercase an email address
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Check the shape of an email address
pub fn validate_email(email: &str) -> Result<(), SessionError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(SessionError::validation("email", "is required"));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(SessionError::validation("email", "must not contain spaces"));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(SessionError::validation("email", "is not a valid address"));
    };
    let domain_ok = !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        && !domain.ends_with('.');

    if local.is_empty() || !domain_ok {
        return Err(SessionError::validation("email", "is not a valid address"));
    }
    Ok(())
}

/// Check a password submitted for sign-in
pub fn validate_password(password: &str) -> Result<(), SessionError> {
    if password.is_empty() {
        return Err(SessionError::validation("password", "is required"));
    }
    Ok(())
}

/// Check a password chosen at sign-up
pub fn validate_new_password(password: &str) -> Result<(), SessionError> {
    validate_password(password)?;
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(SessionError::validation(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(SessionError::validation(
            "password",
            format!("must be at most {MAX_PASSWORD_LEN} bytes"),
        ));
    }
    Ok(())
}

/// Check an optional display name
pub fn validate_display_name(name: Option<&str>) -> Result<(), SessionError> {
    let Some(name) = name else {
        return Ok(());
    };
    if name.trim().is_empty() {
        return Err(SessionError::validation("display_name", "must not be blank"));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(SessionError::validation(
            "display_name",
            format!("must be at most {MAX_DISPLAY_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

/// Check a bearer or refresh token
pub fn validate_token(field: &str, token: &str) -> Result<(), SessionError> {
    if token.trim().is_empty() {
        return Err(SessionError::validation(field, "is required"));
    }
    Ok(())
}

/// Validate sign-in input
pub fn validate_credentials(credentials: &Credentials) -> Result<(), SessionError> {
    validate_email(&credentials.email)?;
    validate_password(&credentials.password)
}

/// Validate sign-up input
pub fn validate_sign_up(request: &SignUpRequest) -> Result<(), SessionError> {
    validate_email(&request.credentials.email)?;
    validate_new_password(&request.credentials.password)?;
    validate_display_name(request.display_name.as_deref())
}
