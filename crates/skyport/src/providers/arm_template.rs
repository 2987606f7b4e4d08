//! ARM template for one Linux VM. Every VM gets its own storage account
//! (holding the OS disk VHD), public IP with a DNS label, virtual network
//! and NIC, which is the set that server teardown knows how to remove.

use serde_json::Value;

use crate::parser::ContentKind;
use crate::{Error, Result};

const COMPUTE: &str = include_str!("arm-compute.json");

pub(super) fn compute() -> Result<Value> {
    serde_json::from_str(COMPUTE).map_err(|e| Error::Parse {
        kind: ContentKind::Json,
        message: format!("arm template: {e}"),
        snippet: COMPUTE.chars().take(64).collect(),
    })
}
