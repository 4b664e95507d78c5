//! X.509 and PKCS#12 parsing for signing certificates.
//!
//! Keychain listings, P12 exports and App Store Connect responses all end up
//! here as DER bytes; the SHA-1 of those bytes is the fingerprint used
//! everywhere else (it is what `security` prints).

use crate::config::CertificateType;
use crate::error::{CertificateErrorKind, ReleaseError, Result};
use crate::model::{Certificate, is_valid_team_id};
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use x509_certificate::X509Certificate;

/// Fields pulled out of one DER certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub common_name: String,
    pub issuer: String,
    pub organizational_unit: Option<String>,
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
    pub fingerprint: String,
}

impl CertificateDetails {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = X509Certificate::from_der(der).map_err(|e| {
            ReleaseError::certificate(
                CertificateErrorKind::Invalid,
                format!("Failed to parse certificate DER: {e}"),
            )
        })?;
        Ok(Self::from_parsed(&cert, der))
    }

    /// Every certificate in concatenated PEM, as printed by
    /// `security find-certificate -a -p`.
    pub fn from_pem_bundle(pem: &str) -> Result<Vec<Self>> {
        let certs = X509Certificate::from_pem_multiple(pem).map_err(|e| {
            ReleaseError::certificate(
                CertificateErrorKind::Invalid,
                format!("Failed to parse PEM certificates: {e}"),
            )
        })?;
        certs
            .iter()
            .map(|cert| -> Result<Self> {
                let der = cert.encode_der()?;
                Ok(Self::from_parsed(cert, &der))
            })
            .collect()
    }

    fn from_parsed(cert: &X509Certificate, der: &[u8]) -> Self {
        let organizational_unit = cert
            .subject_name()
            .iter_organizational_unit()
            .find_map(|atav| atav.to_string().ok());

        Self {
            common_name: cert.subject_common_name().unwrap_or_default(),
            issuer: cert.issuer_common_name().unwrap_or_default(),
            organizational_unit,
            not_after: cert.validity_not_after(),
            serial_number: hex::encode_upper(cert.serial_number_asn1().as_slice()),
            fingerprint: sha1_fingerprint(der),
        }
    }

    /// Signing type from the common name, if it is an Apple signing cert.
    #[must_use]
    pub fn cert_type(&self) -> Option<CertificateType> {
        CertificateType::from_common_name(&self.common_name)
    }

    /// Team id from the organizational unit, if well-formed.
    #[must_use]
    pub fn team_id(&self) -> Option<&str> {
        self.organizational_unit
            .as_deref()
            .filter(|ou| is_valid_team_id(ou))
    }

    /// Build the certificate value object. `fallback_type` is used when the
    /// common name does not reveal the type (e.g. a renamed export).
    pub fn to_certificate(
        &self,
        id: Option<&str>,
        fallback_type: Option<CertificateType>,
    ) -> Option<Certificate> {
        let cert_type = self.cert_type().or(fallback_type)?;
        let cert = Certificate::new(
            id.unwrap_or(&self.fingerprint),
            &self.common_name,
            cert_type,
            self.not_after,
            &self.serial_number,
            &self.fingerprint,
        );
        match self.team_id() {
            Some(team) => cert.with_team_id(team).ok(),
            None => Some(cert),
        }
    }
}

/// Uppercase hex SHA-1 of DER bytes
#[must_use]
pub fn sha1_fingerprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Decrypted contents of a PKCS#12 export.
pub struct Pkcs12Contents {
    pub certificate_der: Vec<u8>,
    pub details: CertificateDetails,
    pub has_private_key: bool,
}

/// Open a PKCS#12 container with `password`.
///
/// A wrong password is reported as `ImportFailed` so callers can try the
/// next candidate password.
pub fn read_pkcs12(data: &[u8], password: &str) -> Result<Pkcs12Contents> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        ReleaseError::certificate(
            CertificateErrorKind::Invalid,
            format!("Not a valid PKCS#12 file: {e:?}"),
        )
    })?;

    if !pfx.verify_mac(password) {
        return Err(ReleaseError::certificate(
            CertificateErrorKind::ImportFailed,
            "Incorrect PKCS#12 password",
        ));
    }

    let certs = pfx.cert_x509_bags(password).map_err(|e| {
        ReleaseError::certificate(
            CertificateErrorKind::ImportFailed,
            format!("Failed to extract certificates from PKCS#12: {e:?}"),
        )
    })?;
    let keys = pfx.key_bags(password).map_err(|e| {
        ReleaseError::certificate(
            CertificateErrorKind::ImportFailed,
            format!("Failed to extract keys from PKCS#12: {e:?}"),
        )
    })?;

    let certificate_der = certs.into_iter().next().ok_or_else(|| {
        ReleaseError::certificate(CertificateErrorKind::Invalid, "No certificate in PKCS#12")
    })?;
    let details = CertificateDetails::from_der(&certificate_der)?;

    Ok(Pkcs12Contents {
        certificate_der,
        details,
        has_private_key: !keys.is_empty(),
    })
}

/// Pack a certificate and its PKCS#8 private key into a PKCS#12 container.
pub fn build_pkcs12(
    certificate_der: &[u8],
    private_key_der: &[u8],
    password: &str,
    friendly_name: &str,
) -> Result<Vec<u8>> {
    let pfx = p12::PFX::new(certificate_der, private_key_der, None, password, friendly_name)
        .ok_or_else(|| {
            ReleaseError::certificate(
                CertificateErrorKind::ImportFailed,
                "Failed to build PKCS#12 from certificate and key",
            )
        })?;
    Ok(pfx.to_der())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_uppercase_hex() {
        let fp = sha1_fingerprint(b"abc");
        assert_eq!(fp, "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    fn self_signed(common_name: &str) -> rcgen::Certificate {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationalUnitName, "ABCDE12345");
        params.distinguished_name = dn;
        params.self_signed(&key_pair).unwrap()
    }

    #[test]
    fn pem_bundle_yields_every_certificate() {
        let dev = self_signed("Apple Development: Jo (ABCDE12345)");
        let dist = self_signed("Apple Distribution: Acme (ABCDE12345)");
        let listing = format!(
            "SHA-1 hash: 00\n{}SHA-1 hash: 01\n{}",
            dev.pem(),
            dist.pem()
        );

        let details = CertificateDetails::from_pem_bundle(&listing).unwrap();

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].fingerprint, sha1_fingerprint(dev.der()));
        assert_eq!(details[1].fingerprint, sha1_fingerprint(dist.der()));
        assert_eq!(details[1].cert_type(), Some(CertificateType::Distribution));
        assert_eq!(details[0].team_id(), Some("ABCDE12345"));
    }

    #[test]
    fn empty_listing_has_no_certificates() {
        assert!(CertificateDetails::from_pem_bundle("").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_not_pkcs12() {
        assert!(read_pkcs12(b"not a p12", "pw").is_err());
    }
}
