//! Basic and digest authentication (RFC 2617).

use http::header::HeaderValue;
use md5::{Digest as _, Md5};

use crate::util::{basic_auth, fast_random};

/// Credentials configured on a client, replayed after a 401 challenge.
#[derive(Clone)]
pub(crate) enum Credentials {
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

impl Credentials {
    /// Build the `Authorization` value answering `www_authenticate`, if the
    /// challenge scheme matches these credentials.
    pub(crate) fn answer(
        &self,
        www_authenticate: &str,
        method: &str,
        uri: &str,
    ) -> Option<HeaderValue> {
        match self {
            Credentials::Basic { username, password } => {
                let scheme = www_authenticate.split_whitespace().next()?;
                if !scheme.eq_ignore_ascii_case("basic") {
                    return None;
                }
                Some(basic_auth(username, Some(password)))
            }
            Credentials::Digest { username, password } => {
                let challenge = DigestChallenge::parse(www_authenticate)?;
                let cnonce = format!("{:016x}", fast_random());
                let header =
                    challenge.authorization(username, password, method, uri, 1, &cnonce);
                HeaderValue::from_str(&header).ok()
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish()
            }
            Credentials::Digest { username, .. } => {
                f.debug_struct("Digest").field("username", username).finish()
            }
        }
    }
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DigestChallenge {
    pub(crate) realm: String,
    pub(crate) nonce: String,
    pub(crate) opaque: Option<String>,
    pub(crate) qop_auth: bool,
}

impl DigestChallenge {
    /// Parse a challenge, tolerating quoted and unquoted parameter values.
    pub(crate) fn parse(header: &str) -> Option<DigestChallenge> {
        let rest = header.trim();
        let scheme_end = rest.find(char::is_whitespace)?;
        if !rest[..scheme_end].eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut challenge = DigestChallenge::default();
        for (key, value) in split_challenge_params(&rest[scheme_end..]) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => challenge.nonce = value,
                "opaque" => challenge.opaque = Some(value),
                "qop" => {
                    challenge.qop_auth = value
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"));
                }
                "algorithm" => {
                    if !value.eq_ignore_ascii_case("md5") {
                        return None;
                    }
                }
                _ => {}
            }
        }

        if challenge.nonce.is_empty() {
            return None;
        }
        Some(challenge)
    }

    /// Compute the `Authorization` header value for this challenge.
    pub(crate) fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(format!("{username}:{}:{password}", self.realm).as_bytes());
        let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());

        let response = if self.qop_auth {
            md5_hex(
                format!("{ha1}:{}:{nc:08x}:{cnonce}:auth:{ha2}", self.nonce).as_bytes(),
            )
        } else {
            md5_hex(format!("{ha1}:{}:{ha2}", self.nonce).as_bytes())
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
             response=\"{response}\"",
            self.realm, self.nonce
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={nc:08x}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str(", algorithm=MD5");
        header
    }
}

/// Split `k1="v 1", k2=v2, ...`, honoring quotes.
fn split_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim_matches(&[' ', ',', '\t'][..]).to_owned();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    value = stripped[..end].to_owned();
                    rest = &stripped[end + 1..];
                }
                None => {
                    value = stripped.to_owned();
                    rest = "";
                }
            }
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_owned();
            rest = &rest[end..];
        }
        rest = rest.trim_start_matches(&[',', ' ', '\t'][..]);

        if !key.is_empty() {
            params.push((key, value));
        }
    }

    params
}

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
