//! Account classification.
//!
//! Sellers on MercadoLibre can invite collaborators ("operators") who act on
//! the seller's behalf. Their tokens cannot publish as the seller, so only
//! the manager account may be connected.

use mercado_lister_core::MlUserId;

use super::MercadoLibreError;
use super::types::MlUser;

/// Tags and user types that mark a collaborator account.
const COLLABORATOR_MARKERS: &[&str] = &["operator", "collaborator"];

/// Role of an account within a seller organisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Manager,
    Collaborator,
}

/// Classify an account from its `/users/me` profile.
#[must_use]
pub fn classify(user: &MlUser) -> AccountKind {
    let is_marker = |value: &str| {
        COLLABORATOR_MARKERS
            .iter()
            .any(|marker| value.eq_ignore_ascii_case(marker))
    };

    let by_type = user.user_type.as_deref().is_some_and(is_marker);
    let by_tag = user.tags.iter().any(|tag| is_marker(tag));

    if by_type || by_tag {
        AccountKind::Collaborator
    } else {
        AccountKind::Manager
    }
}

/// Accept the profile only if it is the manager account the token was issued for.
///
/// # Errors
///
/// Returns `MercadoLibreError::AccountMismatch` if the profile is a different
/// account than the token's, and `MercadoLibreError::CollaboratorAccount` for
/// collaborator accounts.
pub fn ensure_manager(user: &MlUser, token_user: MlUserId) -> Result<(), MercadoLibreError> {
    if user.id != token_user.get() {
        return Err(MercadoLibreError::AccountMismatch {
            expected: token_user.get(),
            actual: user.id,
        });
    }
    match classify(user) {
        AccountKind::Manager => Ok(()),
        AccountKind::Collaborator => Err(MercadoLibreError::CollaboratorAccount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(user_type: Option<&str>, tags: &[&str]) -> MlUser {
        MlUser {
            id: 55,
            nickname: "VENDEDOR".to_string(),
            site_id: Some("MLA".to_string()),
            email: None,
            first_name: None,
            last_name: None,
            user_type: user_type.map(str::to_string),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            permalink: None,
        }
    }

    #[test]
    fn test_normal_seller_is_manager() {
        assert_eq!(
            classify(&user(Some("normal"), &["normal", "credits_profile"])),
            AccountKind::Manager
        );
        assert!(ensure_manager(&user(None, &[]), MlUserId::new(55)).is_ok());
    }

    #[test]
    fn test_operator_tag_is_collaborator() {
        assert_eq!(
            classify(&user(Some("normal"), &["normal", "operator"])),
            AccountKind::Collaborator
        );
        assert!(matches!(
            ensure_manager(&user(None, &["Collaborator"]), MlUserId::new(55)),
            Err(MercadoLibreError::CollaboratorAccount)
        ));
    }

    #[test]
    fn test_operator_user_type_is_collaborator() {
        assert_eq!(classify(&user(Some("operator"), &[])), AccountKind::Collaborator);
    }

    #[test]
    fn test_profile_must_match_token_account() {
        assert!(matches!(
            ensure_manager(&user(None, &[]), MlUserId::new(56)),
            Err(MercadoLibreError::AccountMismatch {
                expected: 56,
                actual: 55
            })
        ));
    }
}
