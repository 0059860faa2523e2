// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Password hashing and verification.

use crate::CirculationError;

/// Hashes and checks member passwords.
///
/// Implementations are stateless given a stored hash and must be safe to
/// share across threads.
pub trait CredentialVerifier: Send + Sync {
    /// Produces an opaque hash suitable for storage.
    fn hash(&self, password: &str) -> Result<String, CirculationError>;

    /// Returns `Ok(false)` on mismatch; errors only on a malformed hash or
    /// backend failure.
    fn verify(&self, password: &str, hash: &str) -> Result<bool, CirculationError>;
}

/// Lowest cost bcrypt accepts; only sensible for tests.
pub const MIN_BCRYPT_COST: u32 = 4;

/// Highest cost bcrypt accepts.
pub const MAX_BCRYPT_COST: u32 = 31;

/// bcrypt-backed verifier.
#[derive(Debug, Clone, Copy)]
pub struct BcryptVerifier {
    cost: u32,
}

impl BcryptVerifier {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptVerifier {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl CredentialVerifier for BcryptVerifier {
    fn hash(&self, password: &str) -> Result<String, CirculationError> {
        Ok(bcrypt::hash(password, self.cost)?)
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, CirculationError> {
        Ok(bcrypt::verify(password, hash)?)
    }
}

/// Rejects blank passwords.
pub(crate) fn validate_password(password: &str) -> Result<(), CirculationError> {
    if password.trim().is_empty() {
        return Err(CirculationError::InvalidInput(
            "password cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> BcryptVerifier {
        BcryptVerifier::new(MIN_BCRYPT_COST)
    }

    #[test]
    fn hash_is_not_plain_text() {
        let hash = verifier().hash("mysecretpassword").unwrap();
        assert!(!hash.contains("mysecretpassword"));
        assert!(hash.starts_with("$2"));
    }

    #[test]
    fn verify_accepts_only_matching_password() {
        let verifier = verifier();
        let hash = verifier.hash("пароль123").unwrap();
        assert!(verifier.verify("пароль123", &hash).unwrap());
        assert!(!verifier.verify("wrongpassword", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        let result = verifier().verify("anything", "not-a-hash");
        assert!(matches!(result, Err(CirculationError::Credential(_))));
    }

    #[test]
    fn blank_passwords_are_rejected() {
        assert!(validate_password("").is_err());
        assert!(validate_password("   ").is_err());
        assert!(validate_password("!@#$%^&*()").is_ok());
    }
}
