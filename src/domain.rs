use anyhow::{Result, anyhow};

pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Lower-cased ASCII form of a domain, without the wildcard label or trailing dot.
pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input
        .trim()
        .trim_start_matches("*.")
        .trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|err| anyhow!("invalid domain name {input}: {err}"))?;
    Ok(ascii.to_lowercase())
}

/// Relative TXT record name for a DNS-01 challenge inside `zone_name`.
///
/// Returns `_acme-challenge` at the zone apex and `_acme-challenge.<prefix>`
/// below it, or `None` when the domain does not belong to the zone.
pub fn challenge_record_name(domain: &str, zone_name: &str) -> Option<String> {
    let domain = normalize_domain(domain).ok()?;
    let zone_name = normalize_domain(zone_name).ok()?;
    if domain == zone_name {
        return Some(ACME_CHALLENGE_LABEL.to_string());
    }
    let prefix = domain.strip_suffix(&format!(".{zone_name}"))?;
    Some(format!("{ACME_CHALLENGE_LABEL}.{prefix}"))
}
