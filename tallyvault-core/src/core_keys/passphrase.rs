//! Passphrase strength policy.
//!
//! Applied before any key derivation. A passphrase is accepted when it is
//! non-blank, at least [`MIN_LENGTH`] characters long, not one character
//! repeated, and either mixes three character classes or is at least
//! [`LONG_PASSPHRASE_LENGTH`] characters long.

use crate::errors::{VaultError, VaultResult};

/// Minimum number of characters.
pub const MIN_LENGTH: usize = 12;

/// Length at which character-class diversity is no longer required.
pub const LONG_PASSPHRASE_LENGTH: usize = 20;

const MIN_CHARACTER_CLASSES: usize = 3;

/// Validate a passphrase against the strength policy.
///
/// Returns `WeakPassphrase` describing the first rule that failed.
pub fn validate_passphrase(passphrase: &str) -> VaultResult<()> {
    if passphrase.trim().is_empty() {
        return Err(VaultError::WeakPassphrase(
            "passphrase cannot be blank".to_string(),
        ));
    }

    let length = passphrase.chars().count();
    if length < MIN_LENGTH {
        return Err(VaultError::WeakPassphrase(format!(
            "passphrase must be at least {} characters (got {})",
            MIN_LENGTH, length
        )));
    }

    let mut chars = passphrase.chars();
    if let Some(first) = chars.next() {
        if chars.all(|c| c == first) {
            return Err(VaultError::WeakPassphrase(
                "passphrase cannot be a single repeated character".to_string(),
            ));
        }
    }

    let classes = character_classes(passphrase);
    if length < LONG_PASSPHRASE_LENGTH && classes < MIN_CHARACTER_CLASSES {
        return Err(VaultError::WeakPassphrase(format!(
            "passphrase must mix at least {} of lowercase, uppercase, digits and symbols, \
             or be at least {} characters long",
            MIN_CHARACTER_CLASSES, LONG_PASSPHRASE_LENGTH
        )));
    }

    Ok(())
}

fn character_classes(passphrase: &str) -> usize {
    let lower = passphrase.chars().any(|c| c.is_lowercase());
    let upper = passphrase.chars().any(|c| c.is_uppercase());
    let digit = passphrase.chars().any(|c| c.is_ascii_digit());
    let other = passphrase
        .chars()
        .any(|c| !c.is_lowercase() && !c.is_uppercase() && !c.is_ascii_digit());
    [lower, upper, digit, other].iter().filter(|&&b| b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_weak(passphrase: &str) {
        assert!(
            matches!(validate_passphrase(passphrase), Err(VaultError::WeakPassphrase(_))),
            "expected '{}' to be rejected",
            passphrase
        );
    }

    #[test]
    fn test_blank_rejected() {
        assert_weak("");
        assert_weak("                ");
    }

    #[test]
    fn test_short_rejected() {
        assert_weak("Ab1!");
        assert_weak("Abcdefgh12!");
    }

    #[test]
    fn test_repeated_character_rejected() {
        assert_weak("aaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_low_diversity_short_rejected() {
        assert_weak("abcdefghijklmn");
    }

    #[test]
    fn test_mixed_classes_accepted() {
        assert!(validate_passphrase("Ledger-2024-ok").is_ok());
    }

    #[test]
    fn test_long_single_class_accepted() {
        assert!(validate_passphrase("correct horse battery staple").is_ok());
    }
}
