//! Certificates as reuse decisions see them.
//!
//! Nothing here parses X.509. The TLS collaborator hands over the peer chain
//! already reduced to the fields that connection reuse needs: the subject
//! alternative names of the leaf, and the public key bytes of every
//! certificate for pinning. The subject common name is carried for
//! diagnostics only and is never consulted when matching hostnames.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A peer certificate, reduced to the fields connection reuse cares about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    subject: String,
    dns_names: Vec<String>,
    spki: Bytes,
}

impl Certificate {
    /// Create a certificate from its subject common name, the DNS entries of
    /// its subject alternative name extension, and its subject public key
    /// info bytes.
    pub fn new(
        subject: impl Into<String>,
        dns_names: Vec<String>,
        spki: impl Into<Bytes>,
    ) -> Self {
        Self {
            subject: subject.into(),
            dns_names,
            spki: spki.into(),
        }
    }

    /// The subject common name. Display only, never matched against.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The DNS entries of the subject alternative name extension.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// SHA-256 digest of the subject public key info.
    pub fn spki_sha256(&self) -> [u8; 32] {
        Sha256::digest(&self.spki).into()
    }
}

/// Whether the leaf of `chain` authenticates `host` through its subject
/// alternative names.
///
/// An empty chain authenticates nothing. The common name does not
/// participate, even when no alternative names are present.
pub fn chain_covers(chain: &[Certificate], host: &str) -> bool {
    chain
        .first()
        .map(|leaf| leaf.dns_names.iter().any(|san| san_matches(san, host)))
        .unwrap_or(false)
}

/// Whether a single SAN DNS entry matches `host`.
///
/// Plain entries compare case-insensitively. A `*.suffix` entry matches
/// hosts with exactly one label in front of `suffix`; deeper names and the
/// bare suffix do not match.
pub fn san_matches(san: &str, host: &str) -> bool {
    if let Some(suffix) = san.strip_prefix("*.") {
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        san.eq_ignore_ascii_case(host)
    }
}

/// A single certificate pin: a host pattern plus the SHA-256 digest of an
/// acceptable subject public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pin {
    pattern: String,
    digest: [u8; 32],
}

impl Pin {
    /// Parse a pin from its textual `sha256/<base64>` form.
    pub fn new(pattern: impl Into<String>, digest: &str) -> Result<Self, PinParseError> {
        let encoded = digest
            .strip_prefix("sha256/")
            .ok_or_else(|| PinParseError::Algorithm(digest.to_owned()))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| PinParseError::Digest(digest.to_owned()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PinParseError::Digest(encoded.to_owned()))?;
        Ok(Self {
            pattern: pattern.into(),
            digest,
        })
    }

    /// Pin `pattern` to the public key of a known certificate.
    pub fn of(pattern: impl Into<String>, certificate: &Certificate) -> Self {
        Self {
            pattern: pattern.into(),
            digest: certificate.spki_sha256(),
        }
    }

    /// The host pattern this pin applies to.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this pin's pattern covers `host`. Patterns follow the same
    /// label rules as SAN entries: exact, or single-label `*.suffix`.
    pub fn applies_to(&self, host: &str) -> bool {
        san_matches(&self.pattern, host)
    }

    fn matches(&self, certificate: &Certificate) -> bool {
        self.digest == certificate.spki_sha256()
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: sha256/{}", self.pattern, BASE64.encode(self.digest))
    }
}

/// The textual form of a pin could not be parsed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PinParseError {
    /// The digest does not carry a supported algorithm prefix.
    #[error("unsupported pin algorithm, expected a sha256/ prefix: {0}")]
    Algorithm(String),

    /// The digest is not valid base64 for a 32 byte hash.
    #[error("invalid pin digest: {0}")]
    Digest(String),
}

/// Restricts the certificates accepted for pinned hosts to a known set of
/// public keys, independent of chain-of-trust validation.
///
/// Hosts without a matching pin pattern are unconstrained. Compared by
/// value, so two addresses built from equal pinners may share connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
}

impl CertificatePinner {
    /// A pinner with no pins; every chain passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pin.
    pub fn add(mut self, pin: Pin) -> Self {
        self.pins.push(pin);
        self
    }

    /// Whether any pin is declared for `host`.
    pub fn has_pins_for(&self, host: &str) -> bool {
        self.pins.iter().any(|pin| pin.applies_to(host))
    }

    /// Check a peer chain against the pins declared for `host`.
    ///
    /// Passes trivially when no pin covers the host; otherwise at least one
    /// certificate anywhere in the chain must carry a pinned public key.
    pub fn check(&self, host: &str, chain: &[Certificate]) -> bool {
        let pins: Vec<&Pin> = self.pins.iter().filter(|pin| pin.applies_to(host)).collect();
        if pins.is_empty() {
            return true;
        }

        chain
            .iter()
            .any(|certificate| pins.iter().any(|pin| pin.matches(certificate)))
    }

    /// Render the pin of a certificate in its textual form.
    pub fn pin(certificate: &Certificate) -> String {
        format!("sha256/{}", BASE64.encode(certificate.spki_sha256()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate(subject: &str, sans: &[&str]) -> Certificate {
        Certificate::new(
            subject,
            sans.iter().map(|s| s.to_string()).collect(),
            subject.as_bytes().to_vec(),
        )
    }

    #[test]
    fn san_exact_match_is_case_insensitive() {
        assert!(san_matches("example.com", "example.com"));
        assert!(san_matches("EXAMPLE.com", "example.COM"));
        assert!(!san_matches("example.com", "other.com"));
    }

    #[test]
    fn san_wildcard_matches_one_label() {
        assert!(san_matches("*.wildcard.com", "www.wildcard.com"));
        assert!(san_matches("*.wildcard.com", "WWW.WILDCARD.COM"));
        assert!(!san_matches("*.wildcard.com", "wildcard.com"));
        assert!(!san_matches("*.wildcard.com", "a.b.wildcard.com"));
        assert!(!san_matches("*.wildcard.com", "com"));
    }

    #[test]
    fn chain_coverage_uses_the_leaf_only() {
        let leaf = certificate("leaf", &["san.com"]);
        let intermediate = certificate("intermediate", &["other.com"]);

        let chain = vec![leaf, intermediate];
        assert!(chain_covers(&chain, "san.com"));
        assert!(!chain_covers(&chain, "other.com"));
        assert!(!chain_covers(&[], "san.com"));
    }

    #[test]
    fn common_name_never_counts() {
        let chain = vec![certificate("nonsan.com", &["san.com"])];
        assert!(!chain_covers(&chain, "nonsan.com"));
    }

    #[test]
    fn pin_parses_and_displays_round_trip() {
        let cert = certificate("leaf", &["san.com"]);
        let text = CertificatePinner::pin(&cert);
        let pin = Pin::new("san.com", &text).unwrap();
        assert!(pin.matches(&cert));
        assert_eq!(pin.to_string(), format!("san.com: {text}"));
    }

    #[test]
    fn pin_rejects_unknown_algorithm_and_bad_digest() {
        assert!(matches!(
            Pin::new("san.com", "sha1/afwiKY3RxoMmLkuRW1l7QsPZTJPwDS2pdDROQjXw8ig="),
            Err(PinParseError::Algorithm(_))
        ));
        assert!(matches!(
            Pin::new("san.com", "sha256/not-base64!"),
            Err(PinParseError::Digest(_))
        ));
        assert!(matches!(
            Pin::new("san.com", "sha256/AAAA"),
            Err(PinParseError::Digest(_))
        ));
    }

    #[test]
    fn pinner_without_pins_for_host_passes() {
        let cert = certificate("leaf", &["san.com"]);
        let pinner = CertificatePinner::new().add(Pin::of("pinned.com", &cert));

        assert!(!pinner.has_pins_for("san.com"));
        assert!(pinner.check("san.com", &[certificate("other", &["san.com"])]));
    }

    #[test]
    fn pinner_requires_a_matching_key_for_pinned_hosts() {
        let pinned = certificate("leaf", &["san.com"]);
        let other = certificate("other", &["san.com"]);
        let pinner = CertificatePinner::new().add(Pin::of("san.com", &pinned));

        assert!(pinner.check("san.com", &[pinned.clone()]));
        assert!(!pinner.check("san.com", &[other]));
    }

    #[test]
    fn pinner_matches_any_certificate_in_the_chain() {
        let leaf = certificate("leaf", &["san.com"]);
        let root = certificate("root", &[]);
        let pinner = CertificatePinner::new().add(Pin::of("san.com", &root));

        assert!(pinner.check("san.com", &[leaf, root]));
    }

    #[test]
    fn pin_patterns_support_wildcards() {
        let cert = certificate("leaf", &["san.com"]);
        let pinner = CertificatePinner::new().add(Pin::of("*.pinned.com", &cert));

        assert!(pinner.has_pins_for("api.pinned.com"));
        assert!(!pinner.has_pins_for("pinned.com"));
        assert!(!pinner.check("api.pinned.com", &[certificate("other", &[])]));
    }
}
