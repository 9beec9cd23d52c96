//! Certificate identity extraction.
//!
//! Parses the leaf of a provider's chain and extracts the fields worth
//! logging at startup: subject and issuer Common Names, SAN URIs and DNS
//! names, and the expiry date.

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::{Error, Result};

/// Identity fields of a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name (CN).
    pub common_name: Option<String>,

    /// Issuer Common Name.
    pub issuer: Option<String>,

    /// Subject Alternative Name URI entries (e.g. SPIFFE IDs).
    pub san_uris: Vec<String>,

    /// Subject Alternative Name DNS entries.
    pub san_dns_names: Vec<String>,

    /// `notAfter`, formatted for humans.
    pub not_after: String,

    /// Human-readable label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse client certificate: {e}")))?;

        let common_name = first_cn(cert.subject());
        let issuer = first_cn(cert.issuer());
        let (san_uris, san_dns_names) = extract_sans(&cert);
        let display_name = build_display_name(common_name.as_ref(), &san_uris);

        Ok(Self {
            common_name,
            issuer,
            san_uris,
            san_dns_names,
            not_after: cert.validity().not_after.to_string(),
            display_name,
        })
    }
}

fn first_cn(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut uris = Vec::new();
    let mut dns_names = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::URI(uri) => uris.push((*uri).to_owned()),
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                _ => {}
            }
        }
    }

    (uris, dns_names)
}

/// Prefers a SPIFFE URI, then the CN, then `"<unknown>"`.
fn build_display_name(cn: Option<&String>, san_uris: &[String]) -> String {
    san_uris
        .iter()
        .find(|u| u.starts_with("spiffe://"))
        .map(String::as_str)
        .or_else(|| cn.map(String::as_str))
        .unwrap_or("<unknown>")
        .to_owned()
}
