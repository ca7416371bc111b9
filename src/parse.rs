//! Field parsers for response lines.
//!
//! The module's responses are fixed-format comma separated fields with
//! double-quoted text, so these are plain slice walkers. A `None` anywhere
//! means the line is malformed and the caller treats it like a timeout.

/// Parse the tail of an inbound-data announcement: `,<id>,<len>` with the
/// `:` terminator already consumed.
pub(crate) fn inbound_header(s: &str) -> Option<(usize, usize)> {
    let s = s.strip_prefix(',')?;
    let (id, len) = s.split_once(',')?;
    Some((id.trim().parse().ok()?, len.trim().parse().ok()?))
}

/// First double-quoted field of `s`.
///
/// Returns the field content and the text after the closing quote.
pub(crate) fn quoted_field(s: &str) -> Option<(&str, &str)> {
    let open = s.find('"')?;
    let rest = &s[open + 1..];
    let close = rest.find('"')?;
    Some((&rest[..close], &rest[close + 1..]))
}

/// `aa:bb:cc:dd:ee:ff` hardware address.
pub(crate) fn mac_address(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.trim().split(':');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Leading (optionally signed) decimal integer of `s`, ignoring whatever
/// follows it.
pub(crate) fn leading_int(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_header_fields() {
        assert_eq!(inbound_header(",0,5"), Some((0, 5)));
        assert_eq!(inbound_header(",4,1460"), Some((4, 1460)));
        assert_eq!(inbound_header("0,5"), None);
        assert_eq!(inbound_header(",x,5"), None);
        assert_eq!(inbound_header(",3"), None);
    }

    #[test]
    fn quoted_fields_in_sequence() {
        let line = "+CWJAP_CUR:\"lab\",\"aa:bb:cc:dd:ee:ff\",6,-53";
        let (ssid, rest) = quoted_field(line).unwrap();
        assert_eq!(ssid, "lab");
        let (bssid, rest) = quoted_field(rest).unwrap();
        assert_eq!(bssid, "aa:bb:cc:dd:ee:ff");
        assert_eq!(quoted_field(rest), None);
    }

    #[test]
    fn quoted_field_empty() {
        assert_eq!(quoted_field("\"\",tail"), Some(("", ",tail")));
        assert_eq!(quoted_field("no quotes"), None);
    }

    #[test]
    fn mac_addresses() {
        assert_eq!(
            mac_address("aa:bb:cc:dd:ee:ff"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(mac_address("0:1:2:3:4:5"), Some([0, 1, 2, 3, 4, 5]));
        assert_eq!(mac_address("aa:bb:cc:dd:ee"), None);
        assert_eq!(mac_address("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(mac_address("zz:bb:cc:dd:ee:ff"), None);
    }

    #[test]
    fn leading_ints() {
        assert_eq!(leading_int("42"), Some(42));
        assert_eq!(leading_int("-70,\"x\""), Some(-70));
        assert_eq!(leading_int(" 6)"), Some(6));
        assert_eq!(leading_int("1.5.4"), Some(1));
        assert_eq!(leading_int("abc"), None);
        assert_eq!(leading_int(""), None);
    }
}
