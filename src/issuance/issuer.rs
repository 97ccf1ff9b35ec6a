use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::errors::CertError;
use crate::settings::CertificateProfile;

/// Issued certificate ready for upload to the secret store.
pub struct IssuedCertificate {
    /// PKCS#12 archive protected with the profile's password
    pub pfx: Vec<u8>,
}

/// Core operation any certificate issuer must support.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn request_certificate(
        &self,
        profile: &CertificateProfile,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificate, CertError>;
}
