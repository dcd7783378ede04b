use std::net::Ipv4Addr;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {

    // Issued under the current secret.
    Fresh,

    // Issued under the previous generation, still accepted for one
    // rotation cycle so in-flight announcements validate.
    Grace,

    Invalid,

}

// Two generations of announce secrets. A token is a cheap MAC binding
// an announcement to the address the tracker observed:
// base64(SHA-256(secret || host)).
pub struct SecretRing {

    prior: [u8; SECRET_LEN],

    current: [u8; SECRET_LEN],

}

impl SecretRing {

    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut prior = [0u8; SECRET_LEN];
        let mut current = [0u8; SECRET_LEN];
        rng.fill(&mut prior[..]);
        rng.fill(&mut current[..]);
        Self { prior, current }
    }

    // prior <- current, current <- fresh random.
    pub fn rotate(&mut self) {
        self.prior = self.current;
        rand::thread_rng().fill(&mut self.current[..]);
    }

    pub fn issue(&self, host: Ipv4Addr) -> String {
        hash_token(&self.current, host)
    }

    // True iff the token was issued by us, under the current secret,
    // for this host. Doubles as echo detection for reflected
    // announcements.
    pub fn matches_current(&self, token: &str, host: Ipv4Addr) -> bool {
        token == self.issue(host)
    }

    pub fn validate(&self, token: &str, host: Ipv4Addr) -> TokenValidity {
        if token == hash_token(&self.current, host) {
            TokenValidity::Fresh
        } else if token == hash_token(&self.prior, host) {
            TokenValidity::Grace
        } else {
            TokenValidity::Invalid
        }
    }
}

fn hash_token(secret: &[u8], host: Ipv4Addr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(host.to_string().as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const OTHER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

    #[test]
    fn test_token_binds_to_host() {
        let ring = SecretRing::new();
        let token = ring.issue(HOST);
        assert_eq!(ring.validate(&token, HOST), TokenValidity::Fresh);
        assert_eq!(ring.validate(&token, OTHER), TokenValidity::Invalid);
        assert_eq!(ring.validate("bogus", HOST), TokenValidity::Invalid);
        assert!(ring.matches_current(&token, HOST));
        assert!(!ring.matches_current(&token, OTHER));
    }

    #[test]
    fn test_token_format() {
        // base64(SHA-256(secret || dotted-quad host))
        let ring = SecretRing::new();
        let mut hasher = Sha256::new();
        hasher.update(ring.current);
        hasher.update(b"203.0.113.9");
        assert_eq!(ring.issue(HOST), BASE64.encode(hasher.finalize()));
    }

    #[test]
    fn test_rotation_grace_then_reject() {
        let mut ring = SecretRing::new();
        let token = ring.issue(HOST);

        ring.rotate();
        assert_eq!(ring.validate(&token, HOST), TokenValidity::Grace);
        assert!(!ring.matches_current(&token, HOST));
        let interim = ring.issue(HOST);

        ring.rotate();
        assert_eq!(ring.validate(&token, HOST), TokenValidity::Invalid);
        assert_eq!(ring.validate(&interim, HOST), TokenValidity::Grace);
    }

    #[test]
    fn test_generations_are_distinct() {
        let mut ring = SecretRing::new();
        let before = ring.issue(HOST);
        ring.rotate();
        assert_ne!(before, ring.issue(HOST));
    }
}
