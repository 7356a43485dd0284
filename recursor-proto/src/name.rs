//! Canonical name forms shared by the cache keys and the resolver.

/// Longest lookup form of a name, counting every label terminator.
pub const LOOKUP_MAXLEN: usize = 255;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name cannot be encoded in lookup form")]
    NotRepresentable,
}

/// Encode a name in lookup form: lowercased, label order reversed, each
/// label NUL-terminated, so that byte-prefix scans correspond to DNS
/// subtree scans. `nic.cz` becomes `cz\0nic\0`; the root name is `\0`.
pub fn lookup_form(name: &str) -> Result<Vec<u8>, NameError> {
    if name.is_empty() || name == "." {
        return Ok(vec![0]);
    }
    let mut out = Vec::with_capacity(name.len() + 1);
    for label in name.trim_end_matches('.').split('.').rev() {
        if label.is_empty() || label.len() > 63 {
            return Err(NameError::NotRepresentable);
        }
        out.extend(label.bytes().map(|b| b.to_ascii_lowercase()));
        out.push(0);
    }
    if out.len() > LOOKUP_MAXLEN {
        return Err(NameError::NotRepresentable);
    }
    Ok(out)
}

/// Lowercase a name for comparison and planning.
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// True when both names spell the same domain, case aside.
pub fn equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Immediate parent domain, `None` above the root.
pub fn parent(name: &str) -> Option<&str> {
    if name.is_empty() {
        return None;
    }
    match name.split_once('.') {
        Some((_, rest)) => Some(rest),
        None => Some(""),
    }
}

/// Scramble the letter case of a name from a per-query secret, the 0x20
/// anti-spoofing encoding. Zero secret leaves the name untouched so a
/// coalesced follower can match an already-decoded response.
pub fn apply_secret(name: &str, secret: u64) -> String {
    if secret == 0 {
        return name.to_string();
    }
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            if c.is_ascii_alphabetic() && (secret >> (i % 64)) & 1 == 1 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    #[test]
    fn should_reverse_labels_in_lookup_form() {
        assert_eq!(super::lookup_form("nic.cz").unwrap(), b"cz\0nic\0".to_vec());
    }

    #[test]
    fn should_lowercase_lookup_form() {
        assert_eq!(
            super::lookup_form("NiC.Cz").unwrap(),
            super::lookup_form("nic.cz").unwrap()
        );
    }

    #[test]
    fn should_encode_root_as_single_nul() {
        assert_eq!(super::lookup_form("").unwrap(), vec![0]);
        assert_eq!(super::lookup_form(".").unwrap(), vec![0]);
    }

    #[test]
    fn should_reject_oversized_labels() {
        let name = "a".repeat(64);
        assert_eq!(
            super::lookup_form(&name).unwrap_err(),
            super::NameError::NotRepresentable
        );
    }

    #[test]
    fn should_reject_oversized_names() {
        let name = vec!["abcdefgh"; 32].join(".");
        assert_eq!(
            super::lookup_form(&name).unwrap_err(),
            super::NameError::NotRepresentable
        );
    }

    #[test]
    fn should_walk_parents() {
        assert_eq!(super::parent("www.nic.cz"), Some("nic.cz"));
        assert_eq!(super::parent("cz"), Some(""));
        assert_eq!(super::parent(""), None);
    }

    #[test]
    fn should_apply_secret_deterministically() {
        let scrambled = super::apply_secret("example.com", 0xA5A5_A5A5_A5A5_A5A5);
        assert_eq!(scrambled, super::apply_secret("Example.Com", 0xA5A5_A5A5_A5A5_A5A5));
        assert!(super::equal(&scrambled, "example.com"));
        assert_eq!(super::apply_secret("example.com", 0), "example.com");
    }
}
