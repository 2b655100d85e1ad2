//! Command implementations for the Iden-Hide CLI.

pub mod batch;
pub mod storage;

use anyhow::anyhow;
use idenhide_core::Credentials;

/// Reads AWS credentials from the environment.
pub fn credentials_from_env() -> anyhow::Result<Credentials> {
    Credentials::from_env().ok_or_else(|| {
        anyhow!("AWS credentials not found. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY (and optionally AWS_SESSION_TOKEN).")
    })
}
