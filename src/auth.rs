use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Authenticated identity behind a connection. Immutable for the
/// connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("account disabled")]
    AccountDisabled,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::AccountDisabled => "account_disabled",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    disabled: bool,
    #[allow(dead_code)]
    exp: usize,
}

/// Verifies bearer tokens and resolves them to a [`Principal`].
///
/// Token issuance lives elsewhere; this side only needs the shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Absent, malformed, or expired tokens are all `Unauthenticated`; a
    /// well-formed token for a disabled account is `AccountDisabled`.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::Unauthenticated)?;
        let claims = data.claims;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        if claims.disabled {
            return Err(AuthError::AccountDisabled);
        }

        Ok(Principal {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}

#[cfg(test)]
pub(crate) fn mint_token(secret: &str, user_id: &str, email: &str, disabled: bool) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        email: &'a str,
        disabled: bool,
        exp: usize,
    }

    let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
    encode(
        &Header::default(),
        &TestClaims {
            sub: user_id,
            email,
            disabled,
            exp,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn valid_token_resolves_principal() {
        let verifier = TokenVerifier::new(SECRET);
        let token = mint_token(SECRET, "user-1", "host@example.com", false);

        let principal = verifier.verify(&token).unwrap();
        assert_eq!(principal.user_id, "user-1");
        assert_eq!(principal.email, "host@example.com");
    }

    #[test]
    fn disabled_account_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        let token = mint_token(SECRET, "user-1", "host@example.com", true);

        assert_eq!(verifier.verify(&token), Err(AuthError::AccountDisabled));
    }

    #[test]
    fn garbage_and_wrong_secret_are_unauthenticated() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.verify(""), Err(AuthError::Unauthenticated));
        assert_eq!(
            verifier.verify("not-a-jwt"),
            Err(AuthError::Unauthenticated)
        );

        let token = mint_token("other-secret", "user-1", "host@example.com", false);
        assert_eq!(verifier.verify(&token), Err(AuthError::Unauthenticated));
    }
}
