//! Header name helpers

/// Canonical MIME form of a header name: the first letter and every letter
/// following a hyphen are upper-cased, the rest lower-cased.
///
/// Names containing anything other than token characters are returned as-is.
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }

    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(canonical_header_key("accept"), "Accept");
        assert_eq!(canonical_header_key("x-b3-traceid"), "X-B3-Traceid");
    }

    #[test]
    fn test_non_token_names_unchanged() {
        assert_eq!(canonical_header_key("bad header"), "bad header");
        assert_eq!(canonical_header_key(""), "");
    }
}
