pub mod acme;
pub mod bundle;
pub mod challenge;
pub mod dns;
pub mod dns_providers;
pub mod engine;
pub mod issuer;

pub use engine::AcmeIssuanceEngine;
pub use issuer::{CertificateIssuer, IssuedCertificate};
