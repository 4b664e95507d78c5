use super::{AppleApiClient, Document, Resource};
use crate::certificates::CertificateDetails;
use crate::config::CertificateType;
use crate::error::{ApiErrorKind, CertificateErrorKind, ReleaseError, Result};
use crate::model::Certificate;
use crate::repository::{CertificateRepository, CreatedCertificate};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroizing;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateAttributes {
    #[serde(default)]
    name: String,
    certificate_type: String,
    #[serde(default)]
    certificate_content: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
    expiration_date: DateTime<Utc>,
}

/// Key pair and PEM signing request for a new certificate.
///
/// Returns `(csr_pem, pkcs8_private_key_der)`.
pub fn generate_signing_request(common_name: &str) -> Result<(String, Zeroizing<Vec<u8>>)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let rcgen_error = |e: rcgen::Error| {
        ReleaseError::certificate(
            CertificateErrorKind::Invalid,
            format!("Failed to generate signing request: {e}"),
        )
    };

    let key_pair = KeyPair::generate().map_err(rcgen_error)?;
    let mut params = CertificateParams::new(vec![]).map_err(rcgen_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key_pair).map_err(rcgen_error)?;
    let csr_pem = csr.pem().map_err(rcgen_error)?;
    Ok((csr_pem, Zeroizing::new(key_pair.serialize_der())))
}

/// Sanity checks on DER returned by the authority.
fn validate_certificate_der(der: &[u8]) -> Result<()> {
    let invalid = |message: String| ReleaseError::api(ApiErrorKind::Rejected, None, message);
    if der.is_empty() {
        return Err(invalid("Empty certificate from Apple".to_string()));
    }
    if der[0] != 0x30 {
        return Err(invalid(format!(
            "Invalid DER format (expected 0x30, got 0x{:02x})",
            der[0]
        )));
    }
    if der.len() < 100 || der.len() > 10_000 {
        return Err(invalid(format!("Suspicious cert size: {} bytes", der.len())));
    }
    Ok(())
}

fn decode_content(content: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|e| {
            ReleaseError::api(
                ApiErrorKind::Rejected,
                None,
                format!("Failed to decode certificate content ({} bytes): {e}", content.len()),
            )
        })
}

fn to_certificate(
    resource: Resource<CertificateAttributes>,
    cert_type: CertificateType,
) -> Option<Certificate> {
    let attributes = resource.attributes;
    let from_der = attributes
        .certificate_content
        .as_deref()
        .and_then(|content| decode_content(content).ok())
        .and_then(|der| CertificateDetails::from_der(&der).ok())
        .and_then(|details| details.to_certificate(Some(&resource.id), Some(cert_type)));

    from_der.or_else(|| {
        // No content in the listing: keep what the attributes say
        Some(Certificate::new(
            resource.id,
            attributes.name,
            cert_type,
            attributes.expiration_date,
            attributes.serial_number.unwrap_or_default(),
            "",
        ))
    })
}

fn type_filter(cert_type: CertificateType) -> &'static str {
    match cert_type {
        CertificateType::Development => "DEVELOPMENT,IOS_DEVELOPMENT",
        CertificateType::Distribution => "DISTRIBUTION,IOS_DISTRIBUTION",
    }
}

#[async_trait]
impl CertificateRepository for AppleApiClient {
    async fn list_certificates(
        &self,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<Vec<Certificate>> {
        let doc: Document<Vec<Resource<CertificateAttributes>>> = self
            .get(&format!(
                "/v1/certificates?filter[certificateType]={}&limit=200",
                type_filter(cert_type)
            ))
            .await?;

        Ok(doc
            .data
            .into_iter()
            .filter(|r| {
                CertificateType::from_apple_api_string(&r.attributes.certificate_type)
                    == Some(cert_type)
            })
            .filter_map(|r| to_certificate(r, cert_type))
            // The key is scoped to one team; certificates without a subject
            // team id are kept
            .filter(|c| c.team_id().is_none_or(|t| t == team_id))
            .collect())
    }

    async fn create_certificate(
        &self,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<CreatedCertificate> {
        let (csr_pem, private_key_der) =
            generate_signing_request(&format!("{} {team_id}", cert_type.display_name()))?;

        let payload = serde_json::json!({
            "data": {
                "type": "certificates",
                "attributes": {
                    "certificateType": cert_type.to_apple_api_string(),
                    "csrContent": csr_pem,
                }
            }
        });
        let doc: Document<Resource<CertificateAttributes>> =
            self.post("/v1/certificates", &payload).await?;

        let content = doc.data.attributes.certificate_content.as_deref().ok_or_else(|| {
            ReleaseError::api(
                ApiErrorKind::Rejected,
                None,
                "Created certificate response has no content",
            )
        })?;
        let certificate_der = decode_content(content)?;
        validate_certificate_der(&certificate_der)?;

        let details = CertificateDetails::from_der(&certificate_der)?;
        let certificate = details
            .to_certificate(Some(&doc.data.id), Some(cert_type))
            .ok_or_else(|| {
                ReleaseError::certificate(
                    CertificateErrorKind::Invalid,
                    format!("Created certificate has unexpected subject '{}'", details.common_name),
                )
            })?;

        Ok(CreatedCertificate {
            certificate,
            certificate_der,
            private_key_der,
        })
    }

    async fn revoke_certificate(&self, id: &str) -> Result<()> {
        self.delete(&format!("/v1/certificates/{id}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_request_is_pem() {
        let (csr, key) = generate_signing_request("Apple Distribution ABCDE12345").unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(!key.is_empty());
    }

    #[test]
    fn rejects_non_der_content() {
        assert!(validate_certificate_der(&[]).is_err());
        assert!(validate_certificate_der(&[0x31; 200]).is_err());
        assert!(validate_certificate_der(&[0x30; 50]).is_err());
        assert!(validate_certificate_der(&[0x30; 500]).is_ok());
    }

    #[test]
    fn listing_without_content_keeps_attributes() {
        let resource = Resource {
            id: "CERT1".to_string(),
            attributes: CertificateAttributes {
                name: "Apple Distribution: Acme".to_string(),
                certificate_type: "DISTRIBUTION".to_string(),
                certificate_content: None,
                serial_number: Some("0A".to_string()),
                expiration_date: Utc::now(),
            },
        };
        let cert = to_certificate(resource, CertificateType::Distribution).unwrap();
        assert_eq!(cert.id(), "CERT1");
        assert_eq!(cert.serial_number(), "0A");
    }
}
