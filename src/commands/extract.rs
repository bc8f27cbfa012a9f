use std::io::Read;

use anyhow::Context;

use crate::consumer::envelope;
use crate::error::ExitError;

/// Read one job envelope from stdin and print the normalized payload.
pub fn run_extract() -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading stdin")?;

    let raw: serde_json::Value = serde_json::from_str(&input)
        .map_err(|e| ExitError::Other(format!("input is not JSON: {e}")))?;
    let payload = envelope::extract_job(raw).map_err(|e| ExitError::Other(e.to_string()))?;

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
