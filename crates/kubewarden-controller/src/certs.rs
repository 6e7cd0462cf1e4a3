//! Serving certificates for policy-server pods.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

pub const CERT_KEY: &str = "tls.crt";
pub const PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone)]
pub struct ServingCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// DNS names a policy server is reachable under from the API server.
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

/// Generates a self-signed certificate valid for `dns_names`. The first name
/// becomes the common name.
pub fn generate_serving_certificate(dns_names: Vec<String>) -> Result<ServingCertificate, rcgen::Error> {
    let common_name = dns_names.first().cloned().unwrap_or_default();
    let mut params = CertificateParams::new(dns_names)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Kubewarden");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok(ServingCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_service_form() {
        let names = service_dns_names("policy-server-default", "kubewarden");
        assert_eq!(names[0], "policy-server-default");
        assert_eq!(names[3], "policy-server-default.kubewarden.svc.cluster.local");
    }

    #[test]
    fn generates_pem_pair() {
        let cert = generate_serving_certificate(service_dns_names("ps", "kubewarden")).unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }
}
