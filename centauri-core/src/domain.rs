/// Checks whether a string is a valid DNS name in the RFC 1035 "preferred
/// form": dot-separated labels of letters, digits and hyphens, where no label
/// starts or ends with a hyphen or exceeds 63 bytes, and the whole name fits
/// in 255 bytes.
///
/// Purely numeric names (bare IPv4 addresses) are rejected, as is anything
/// containing `:` (IPv6 literals, ports), `/`, whitespace or empty labels.
pub fn is_domain_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }

    let mut last = b'.';
    let mut non_numeric = false;
    let mut label_len = 0usize;

    for &c in s.as_bytes() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' => {
                non_numeric = true;
                label_len += 1;
            }
            b'0'..=b'9' => {
                label_len += 1;
            }
            b'-' => {
                // A label cannot begin with a hyphen.
                if last == b'.' {
                    return false;
                }
                non_numeric = true;
                label_len += 1;
            }
            b'.' => {
                // A label cannot be empty or end with a hyphen.
                if last == b'.' || last == b'-' {
                    return false;
                }
                if label_len > 63 {
                    return false;
                }
                label_len = 0;
            }
            _ => return false,
        }
        last = c;
    }

    if last == b'.' || last == b'-' || label_len > 63 {
        return false;
    }

    non_numeric
}
