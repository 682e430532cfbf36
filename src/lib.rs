// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Automated signing and notarization of macOS software.
//!
//! This crate drives a release tree through everything Apple requires
//! before distribution outside the App Store:
//!
//! * Discover signable Mach-O binaries and bundles beneath a directory,
//!   classifying by file header rather than by name. (See [BinaryScanner].)
//! * Sign everything inside-out, so nested code is sealed before the
//!   bundle that contains it, with verify-after-sign and idempotent
//!   re-runs. (See [Signer] and [SigningBackend].)
//! * Package the signed tree into a zip archive that preserves
//!   permissions and symlinks. (See [Archiver].)
//! * Submit the archive to the notarization service and poll with
//!   exponential backoff until Apple reaches a verdict. (See
//!   [NotarizationClient] and [NotaryService].)
//! * Staple the notarization ticket onto bundles, degrading gracefully
//!   when the ticket cannot be retrieved. (See [Stapler].)
//!
//! The [Pipeline] type sequences these stages and produces a structured
//! report with deterministic exit codes. Each stage is also usable on
//! its own.
//!
//! The cryptographic signing operation itself is delegated to the
//! operating system's `codesign` tool; this crate owns orchestration,
//! ordering, and state, not signature generation.

pub mod app_store_connect;
pub mod archiving;
pub mod credentials;
pub mod error;
pub mod notary;
pub mod pipeline;
pub mod scanning;
pub mod signing;
pub mod stapling;

pub use {
    archiving::{Archiver, SubmissionArchive},
    credentials::{CredentialProvider, CredentialScope},
    error::PipelineError,
    notary::{NotarizationClient, NotaryService},
    pipeline::{Pipeline, PipelineConfig, PipelineRun},
    scanning::BinaryScanner,
    signing::{Signer, SigningBackend, SigningIdentity},
    stapling::Stapler,
};
