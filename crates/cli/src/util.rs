use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use typed_path::Utf8NativePathBuf;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

/// Parses repeated `key=value` arguments.
pub fn parse_attributes(values: &[String]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|value| {
            let (key, value) = value
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| anyhow!("Expected key=value, got {value:?}"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
