//! Utility functions and helpers

/// String validation and casemapping utilities
pub mod string {
    /// Case-fold a nickname or channel name per the rfc1459 casemapping:
    /// in addition to ASCII folding, `[]\~` are the uppercase forms of
    /// `{}|^`.
    pub fn casefold(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                'A'..='Z' => c.to_ascii_lowercase(),
                '[' => '{',
                ']' => '}',
                '\\' => '|',
                '~' => '^',
                _ => c,
            })
            .collect()
    }

    /// Compare two names under the rfc1459 casemapping
    pub fn names_equal(a: &str, b: &str) -> bool {
        casefold(a) == casefold(b)
    }

    /// Check if a string is a valid channel name
    pub fn is_valid_channel_name(name: &str) -> bool {
        if name.is_empty() || name.len() > 200 {
            return false;
        }
        let mut chars = name.chars();
        match chars.next() {
            Some('#') | Some('&') | Some('+') | Some('!') => {}
            _ => return false,
        }
        chars.all(|c| c != ' ' && c != ',' && c != '\x07' && c != '\r' && c != '\n')
    }

    /// Check if a string is a valid nickname
    pub fn is_valid_nickname(nick: &str, max_len: usize) -> bool {
        if nick.is_empty() || nick.len() > max_len {
            return false;
        }
        let mut chars = nick.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => return false,
        };
        if !first.is_ascii_alphabetic() && !"[]\\`_^{}|".contains(first) {
            return false;
        }
        chars.all(|c| c.is_ascii_alphanumeric() || "[]\\`_^{}|-".contains(c))
    }

    /// Check if a string is a valid username
    pub fn is_valid_username(user: &str) -> bool {
        !user.is_empty()
            && user.len() <= 12
            && user.chars().all(|c| !c.is_whitespace() && c != '@' && c != '!')
    }
}

/// Wildcard mask and address matching
pub mod mask {
    use crate::utils::string::casefold;
    use std::net::IpAddr;

    /// Match `text` against a mask containing `*` (any run) and `?` (any
    /// single character), case-insensitively under the IRC casemapping.
    pub fn matches(mask: &str, text: &str) -> bool {
        matches_bytes(casefold(mask).as_bytes(), casefold(text).as_bytes())
    }

    fn matches_bytes(mask: &[u8], text: &[u8]) -> bool {
        let (mut m, mut t) = (0usize, 0usize);
        let mut star: Option<(usize, usize)> = None;
        while t < text.len() {
            if m < mask.len() && (mask[m] == b'?' || mask[m] == text[t]) {
                m += 1;
                t += 1;
            } else if m < mask.len() && mask[m] == b'*' {
                star = Some((m, t));
                m += 1;
            } else if let Some((sm, st)) = star {
                m = sm + 1;
                t = st + 1;
                star = Some((sm, st + 1));
            } else {
                return false;
            }
        }
        while m < mask.len() && mask[m] == b'*' {
            m += 1;
        }
        m == mask.len()
    }

    /// Match an address against a CIDR prefix of `bits` bits.
    pub fn matches_cidr(prefix: IpAddr, bits: u8, addr: IpAddr) -> bool {
        match (prefix, addr) {
            (IpAddr::V4(p), IpAddr::V4(a)) => {
                let bits = bits.min(32) as u32;
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(p) & mask) == (u32::from(a) & mask)
            }
            (IpAddr::V6(p), IpAddr::V6(a)) => {
                let bits = bits.min(128) as u32;
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(p) & mask) == (u128::from(a) & mask)
            }
            _ => false,
        }
    }

    /// Match a `user@host` pair against separate user and host masks.
    /// An empty user mask matches any username.
    pub fn matches_user_host(usermask: &str, hostmask: &str, user: &str, host: &str) -> bool {
        (usermask.is_empty() || matches(usermask, user)) && matches(hostmask, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casefold() {
        assert_eq!(string::casefold("Nick[a]\\~"), "nick{a}|^");
        assert!(string::names_equal("alice", "ALICE"));
        assert!(string::names_equal("[a]", "{A}"));
    }

    #[test]
    fn test_channel_names() {
        assert!(string::is_valid_channel_name("#ops"));
        assert!(string::is_valid_channel_name("&local"));
        assert!(string::is_valid_channel_name("+nomode"));
        assert!(!string::is_valid_channel_name("ops"));
        assert!(!string::is_valid_channel_name("#with space"));
        assert!(!string::is_valid_channel_name(""));
    }

    #[test]
    fn test_nicknames() {
        assert!(string::is_valid_nickname("alice", 9));
        assert!(string::is_valid_nickname("[away]", 9));
        assert!(!string::is_valid_nickname("1alice", 9));
        assert!(!string::is_valid_nickname("toolongnickname", 9));
    }

    #[test]
    fn test_mask_matching() {
        assert!(mask::matches("*", "anything"));
        assert!(mask::matches("*.spam.example", "host.spam.example"));
        assert!(mask::matches("evil?", "evil1"));
        assert!(!mask::matches("*.spam.example", "host.ham.example"));
        assert!(mask::matches("*!*@*.example", "a!b@c.example"));
    }

    #[test]
    fn test_cidr_matching() {
        let prefix: std::net::IpAddr = "10.1.0.0".parse().unwrap();
        assert!(mask::matches_cidr(prefix, 16, "10.1.2.3".parse().unwrap()));
        assert!(!mask::matches_cidr(prefix, 16, "10.2.2.3".parse().unwrap()));
        assert!(mask::matches_cidr(prefix, 0, "192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_user_host_masks() {
        assert!(mask::matches_user_host("", "*.example", "anyone", "a.example"));
        assert!(mask::matches_user_host("evil", "*.spam.example", "evil", "h.spam.example"));
        assert!(!mask::matches_user_host("good", "*.spam.example", "evil", "h.spam.example"));
    }
}
