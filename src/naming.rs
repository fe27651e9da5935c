/// Derive the PostgreSQL flexible server name from the deployment name prefix.
///
/// Server host names are global, so the name carries a short hash of the prefix.
pub fn database_server_name(name_prefix: &str) -> String {
    const PREFIX: &str = "pg";
    const MAX_LENGTH: usize = 63;
    let slug = slugify(name_prefix);
    slug_hash_prefix_truncate(&slug, PREFIX, MAX_LENGTH).unwrap_or_else(|| format!("{PREFIX}-{slug}"))
}

/// Derive the public DNS label of the container group.
pub fn dns_label(name_prefix: &str) -> String {
    const PREFIX: &str = "sq";
    const MAX_LENGTH: usize = 63;
    let slug = slugify(name_prefix);
    slug_hash_prefix_truncate(&slug, PREFIX, MAX_LENGTH).unwrap_or_else(|| format!("{PREFIX}-{slug}"))
}

/// Lowercase ASCII alphanumerics, with every other run of characters replaced by a single `-`.
fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive a storage account name: lowercase alphanumerics only, at most 24 characters,
/// ending in eight hex characters of the SHA256 sum of `seed`.
pub fn storage_account_name(name_prefix: &str, seed: &str) -> String {
    const MAX_LENGTH: usize = 24;
    const HASH_LENGTH: usize = 8;
    let slug: String = name_prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let hashed = sha256::digest(seed);
    format!(
        "{}{}",
        truncate(&slug, MAX_LENGTH - HASH_LENGTH),
        truncate(&hashed, HASH_LENGTH)
    )
}

/// Deterministic GUID-shaped name built from the SHA256 sum of `parts`.
///
/// Role assignment names must be GUIDs, and re-running a deployment must
/// produce the same name so the assignment is updated rather than duplicated.
pub fn deterministic_guid(parts: &[&str]) -> String {
    let hashed = sha256::digest(parts.join("/"));
    format!(
        "{}-{}-{}-{}-{}",
        &hashed[0..8],
        &hashed[8..12],
        &hashed[12..16],
        &hashed[16..20],
        &hashed[20..32]
    )
}

/// Concatenate slug and prefix into `<PREFIX>-<TRUNCATED_SLUG>-<HASH>`, where:
/// * `PREFIX` is left as-is,
/// * `TRUNCATED_SLUG` is the part of the slug that still fits into the string after everything is assembled to the maximum length, and
/// * `HASH` is the first four characters of the hex-encoded SHA256 sum of the slug.
///
/// `max_length` must be at least `prefix_len` + 6, otherwise the length of the truncated slug
/// would end up below zero. In this case, `None` is returned.
fn slug_hash_prefix_truncate(slug: &str, prefix: &str, max_length: usize) -> Option<String> {
    const HASH_LENGTH: usize = 4;
    let hashed_slug = sha256::digest(slug);
    let slug_length = max_length.checked_sub(prefix.len() + HASH_LENGTH + 2)?;
    let trimmed = truncate(slug, slug_length).trim_end_matches('-');
    let truncated = truncate(&hashed_slug, HASH_LENGTH);
    Some(
        [prefix, trimmed, truncated]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-"),
    )
}

/// Truncate to at most `length` characters, never splitting one.
fn truncate(s: &str, length: usize) -> &str {
    match s.char_indices().nth(length) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_hash_prefix_truncate() {
        const MAX_LENGTH: usize = 30;
        let slug = "crm-arbeidsforhold-admin";
        let prefix = "gar";
        let expected = "gar-crm-arbeidsforhold-ad-4789";
        let result = slug_hash_prefix_truncate(slug, prefix, MAX_LENGTH).unwrap();
        assert_eq!(result, expected);
        assert_eq!(result.len(), MAX_LENGTH);
    }

    #[test]
    fn test_slug_hash_prefix_truncate_out_of_bounds() {
        let result = slug_hash_prefix_truncate("very-long-slug-that-must-be-truncated", "four", 9);
        assert_eq!(result, None);
    }

    #[test]
    fn storage_account_names_are_valid() {
        let name = storage_account_name("Sonar-Qube_Production-Environment", "westeurope");
        assert!(name.len() <= 24);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(name.starts_with("sonarqubeproduct"));
        assert_eq!(name, storage_account_name("Sonar-Qube_Production-Environment", "westeurope"));
        assert_ne!(name, storage_account_name("Sonar-Qube_Production-Environment", "northeurope"));
    }

    #[test]
    fn guids_are_stable_and_well_formed() {
        let guid = deterministic_guid(&["identity", "registry", "acrpull"]);
        assert_eq!(guid, deterministic_guid(&["identity", "registry", "acrpull"]));
        let groups: Vec<usize> = guid.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn names_are_slugified_and_cut_on_char_boundaries() {
        let name = database_server_name(&format!("{}é", "a".repeat(54)));
        assert!(name.len() <= 63);
        assert!(name.is_ascii());
        assert!(name.starts_with("pg-aaaa"));

        let label = dns_label("Sonar_Qube Prod");
        assert!(label.starts_with("sq-sonar-qube-prod-"), "{label}");
        assert!(label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(label, dns_label("sonar-qube-prod"));

        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[test]
    fn server_and_dns_names_carry_prefix() {
        assert!(database_server_name("sonarqube").starts_with("pg-sonarqube-"));
        assert!(dns_label("sonarqube").starts_with("sq-sonarqube-"));
    }
}
