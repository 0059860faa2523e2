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

//! Library members.

use crate::base::MemberId;
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// A library member.
///
/// The credential hash is opaque to everything except the
/// [`CredentialVerifier`](crate::CredentialVerifier). Members migrated from
/// older records may have no hash and cannot authenticate until reset.
#[derive(Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub credential_hash: Option<String>,
}

impl Member {
    pub fn has_credential(&self) -> bool {
        self.credential_hash.is_some()
    }
}

// Keep hashes out of logs.
impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_credential", &self.has_credential())
            .finish()
    }
}

/// Serializes without the credential hash.
impl Serialize for Member {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Member", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("password_set", &self.has_credential())?;
        state.end()
    }
}
