//! DTLS certificate and fingerprint handling

use crate::engine::{EngineError, Result};
use relaycast_protocol::{DtlsFingerprint, DtlsParameters, DtlsRole};
use sha2::{Digest, Sha256};

/// Hash algorithms accepted in remote fingerprints, with their digest length
const FINGERPRINT_ALGORITHMS: &[(&str, usize)] = &[
    ("sha-1", 20),
    ("sha-224", 28),
    ("sha-256", 32),
    ("sha-384", 48),
    ("sha-512", 64),
];

/// Self-signed certificate shared by every transport of the router
pub struct DtlsCertificate {
    fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsCertificate {
    pub fn generate() -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["relaycast".to_string()])
            .map_err(|e| EngineError::Certificate(e.to_string()))?;

        let digest = Sha256::digest(certified.cert.der());

        Ok(Self {
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: format_fingerprint(&digest),
            }],
        })
    }

    pub fn fingerprints(&self) -> &[DtlsFingerprint] {
        &self.fingerprints
    }

    /// Local parameters advertised before the remote side has connected
    pub fn local_parameters(&self) -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: self.fingerprints.clone(),
        }
    }
}

fn format_fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Check remote DTLS parameters before they are applied to a transport
pub fn validate_remote(parameters: &DtlsParameters) -> Result<()> {
    if parameters.fingerprints.is_empty() {
        return Err(EngineError::InvalidDtlsParameters(
            "no fingerprints given".to_string(),
        ));
    }

    for fingerprint in &parameters.fingerprints {
        let algorithm = fingerprint.algorithm.to_ascii_lowercase();
        let expected_len = FINGERPRINT_ALGORITHMS
            .iter()
            .find(|(name, _)| *name == algorithm)
            .map(|(_, len)| *len)
            .ok_or_else(|| {
                EngineError::InvalidDtlsParameters(format!(
                    "unsupported fingerprint algorithm {}",
                    fingerprint.algorithm
                ))
            })?;

        let octets: Vec<&str> = fingerprint.value.split(':').collect();
        let well_formed = octets.len() == expected_len
            && octets
                .iter()
                .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));

        if !well_formed {
            return Err(EngineError::InvalidDtlsParameters(format!(
                "malformed {} fingerprint",
                fingerprint.algorithm
            )));
        }
    }

    Ok(())
}

/// Role the server takes once the remote role is known
pub fn local_role_for(remote: DtlsRole) -> DtlsRole {
    match remote {
        DtlsRole::Client => DtlsRole::Server,
        DtlsRole::Server | DtlsRole::Auto => DtlsRole::Client,
    }
}
