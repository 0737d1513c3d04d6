//! Random tokens for tags, branches and Call-IDs.
//!
//! These only need to be unique, not unpredictable: a fast non-crypto
//! generator seeded from the OS is used.

use rand::Rng;

use crate::via::BRANCH_MAGIC_COOKIE;

/// A random 32-bit number, as used for tags and branch suffixes
pub fn random_u32() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

/// `z9hG4bK<u32>`
pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_u32())
}

pub fn new_tag() -> String {
    random_u32().to_string()
}

/// A Call-ID local to `host`
pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", random_u32(), host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_has_magic_cookie() {
        let b = new_branch();
        assert!(b.starts_with("z9hG4bK"));
        assert!(b["z9hG4bK".len()..].parse::<u32>().is_ok());
    }

    #[test]
    fn test_call_id_carries_host() {
        assert!(new_call_id("10.0.0.1").ends_with("@10.0.0.1"));
        assert_ne!(new_tag(), "0");
    }
}
