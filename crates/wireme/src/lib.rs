// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! wireme: manage peers in wg-quick configuration files.
//!
//! Files are edited structurally: peers are appended or removed as whole
//! blocks, every other byte of the file is left as it was, and each write is
//! preceded by a timestamped backup.

pub mod allocate;
pub mod credentials;
pub mod document;
pub mod identity;
pub mod install;
pub mod mutate;
pub mod profile;
pub mod runtime;
pub mod settings;
pub mod status;

use chrono::{DateTime, Utc};

/// `YYYY-MM-DDTHH:MM:SSZ`, as written into `created` metadata.
pub fn created_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
