//! Bootstrap token generation
//!
//! Tokens follow kubeadm's `[a-z0-9]{6}.[a-z0-9]{16}` format and are generated
//! locally, then registered on the first master with a bounded TTL.

use aws_lc_rs::digest::{digest, SHA256};

use crate::{Error, Result};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 6;
const SECRET_LEN: usize = 16;

/// A kubeadm bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    string: String,
}

impl BootstrapToken {
    /// Generate a new random bootstrap token
    pub fn generate() -> Result<Self> {
        let id = random_chars(ID_LEN)?;
        let secret = random_chars(SECRET_LEN)?;
        Ok(Self {
            string: format!("{id}.{secret}"),
        })
    }

    /// Wrap an existing token string, checking its format
    pub fn parse(s: &str) -> Result<Self> {
        if !is_valid_format(s) {
            return Err(Error::credential_extraction(
                "bootstrap token does not match [a-z0-9]{6}.[a-z0-9]{16}",
            ));
        }
        Ok(Self {
            string: s.to_string(),
        })
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// Public token id (the part before the dot)
    pub fn id(&self) -> &str {
        self.string.split('.').next().unwrap_or_default()
    }

    /// Short SHA-256 digest of the token, safe to log
    pub fn fingerprint(&self) -> String {
        let hash = digest(&SHA256, self.string.as_bytes());
        hash.as_ref()[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

// Rejection sampling keeps the alphabet uniform: 252 is the largest multiple of 36 <= 256
fn random_chars(len: usize) -> Result<String> {
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while out.len() < len {
        aws_lc_rs::rand::fill(&mut buf)
            .map_err(|_| Error::credential_extraction("random generation failed"))?;
        for &b in buf.iter().filter(|&&b| b < 252) {
            if out.len() == len {
                break;
            }
            out.push(ALPHABET[(b % 36) as usize] as char);
        }
    }
    Ok(out)
}

fn is_valid_format(s: &str) -> bool {
    let valid = |part: &str, len: usize| {
        part.len() == len
            && part
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    match s.split_once('.') {
        Some((id, secret)) => valid(id, ID_LEN) && valid(secret, SECRET_LEN),
        None => false,
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The id is public; the secret half never appears in logs
        f.debug_struct("BootstrapToken")
            .field("id", &self.id())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl std::fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string)
    }
}
