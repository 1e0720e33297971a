// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors

use thiserror::Error;

/// Errors returned by the core cache operations (SPEC_FULL.md §7).
///
/// A miss is not an error: `get`/`delete`/`exists` report it as `Ok(None)` or
/// `Ok(false)`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("value exceeds the largest chunk the segment can allocate")]
    Oversize,

    #[error("stored value is not a valid numeric counter")]
    NonNumeric,

    #[error("key already exists")]
    Exists,

    #[error("key not found")]
    NotFound,

    #[error("lock could not be acquired before the configured timeout")]
    Locked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("segment contents fail structural validation: {0}")]
    Corrupt(String),

    #[error("segment is not attached")]
    Detached,
}

pub type Result<T> = std::result::Result<T, CacheError>;
