// SPDX-License-Identifier: AGPL-3.0-or-later
//! pave: infrastructure lifecycle controller for a single AWS account
//!
//! Terraform declares the infrastructure; pave runs everything around it.
//!
//! # Features
//!
//! * **Bootstrap identity:** creates, validates and destroys the privileged
//!   IAM user Terraform runs as, with a policy that forbids it from modifying
//!   itself
//! * **Key rotation:** deactivates a compromised access key and verifies its
//!   replacement before persisting it
//! * **Gated deployment:** format, lint, security scan and credential checks
//!   before every `plan` and `apply`
//! * **Cleanup and drift:** finds convention-named resources that Terraform
//!   state does not track
//! * **State backend:** switches between local and S3 state and migrates
//!   local state into the bucket

pub mod backend;
pub mod bootstrap;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod confirm;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod outputs;
pub mod policy;
pub mod process;
pub mod rotation;
pub mod sinks;
pub mod status;

pub use config::Config;
pub use credentials::{CredentialStore, Identity, IdentityKind};
pub use error::{PaveError, Result};
