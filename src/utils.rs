//! Identifier generation helpers.

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::WorkflowError;

/// Mint a fresh uuid7, bech32m-encoded under a human-readable prefix.
pub fn new_bech32_id(hrp: &str) -> Result<String, WorkflowError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(WorkflowError::codec)?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes()).map_err(WorkflowError::codec)
}
