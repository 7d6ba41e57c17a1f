use hostd_core::{HostdError, Result};

/// Parse a human size like `512MB`, `20GB` or `1TB` into MiB. A bare number
/// is taken as MiB.
pub fn parse_size_mb(size: &str) -> Result<u64> {
    let size = size.trim().to_uppercase();
    let (digits, unit) = if let Some(v) = size.strip_suffix("TB") {
        (v, 1024 * 1024)
    } else if let Some(v) = size.strip_suffix("GB") {
        (v, 1024)
    } else if let Some(v) = size.strip_suffix("MB") {
        (v, 1)
    } else {
        (size.as_str(), 1)
    };

    let value = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| HostdError::InvalidArgument(format!("Invalid size: {size}")))?;
    if value == 0 {
        return Err(HostdError::InvalidArgument(
            "Size must be greater than zero".to_string(),
        ));
    }
    Ok(value * unit)
}

pub fn format_size_mb(size_mb: u64) -> String {
    if size_mb >= 1024 * 1024 && size_mb % (1024 * 1024) == 0 {
        format!("{}TB", size_mb / (1024 * 1024))
    } else if size_mb >= 1024 && size_mb % 1024 == 0 {
        format!("{}GB", size_mb / 1024)
    } else {
        format!("{size_mb}MB")
    }
}
