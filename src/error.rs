// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Unified error type for the signing and notarization pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("error walking directory tree: {0}")]
    TreeWalk(#[from] walkdir::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("error parsing bundle Info.plist at {0}: {1}")]
    InfoPlist(PathBuf, plist::Error),

    #[error("failed to sign {path}: {reason}")]
    Sign { path: PathBuf, reason: String },

    #[error("signature verification failed for {0}")]
    Verify(PathBuf),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("transient notarization service error: {0}")]
    SubmissionTransient(String),

    #[error("fatal notarization service error: {0}")]
    SubmissionFatal(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("staple error: {0}")]
    Staple(String),

    #[error("required tool not found: {0}")]
    ToolNotFound(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error("App Store Connect API key error: {0}")]
    ApiKey(String),

    #[error("App Store Connect API key not found in default search locations")]
    ApiKeyNotFound,

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("notarization ticket lookup failure: {0}: {1}")]
    TicketLookupFailure(String, String),

    #[error("notarization ticket record not in lookup response: {0}")]
    TicketRecordNotFound(String),

    #[error("error decoding base64 in notarization ticket: {0}")]
    TicketDecode(base64::DecodeError),
}
