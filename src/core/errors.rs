use hyper::StatusCode;
use thiserror::Error;

use crate::issuance::dns::DnsError;
use crate::secrets::store::SecretStoreError;

/// Failure kinds surfaced by the renewal orchestrator and issuance engine.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate {0} not found in the configuration")]
    ProfileNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("certificate {0} is configured but can't be read from the secret store")]
    CertificateUnavailable(String),
    #[error("secret store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("domain {domain} is not under the zone {zone}")]
    DomainOutsideZone { domain: String, zone: String },
    #[error("no challenge handler could complete the authorization for {0}")]
    AuthorizationUnsatisfiable(String),
    #[error("error in domain validation: {0}")]
    DomainValidationFailed(String),
    #[error("order finalization error: {0}")]
    OrderFinalizationError(String),
    #[error("certificate {0} was uploaded but can't be read back from the secret store")]
    PostUploadVerificationFailed(String),
    #[error("validation still pending after {elapsed_secs}s for: {}", .pending.join(","))]
    ValidationTimeout {
        elapsed_secs: u64,
        pending: Vec<String>,
    },
    #[error("acme request failed: {0}")]
    Acme(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CertError {
    /// Coarse externally visible status for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CertError::ProfileNotFound(_) => StatusCode::NOT_FOUND,
            CertError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CertError::CertificateUnavailable(_)
            | CertError::StoreUnavailable(_)
            | CertError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CertError::DomainOutsideZone { .. }
            | CertError::AuthorizationUnsatisfiable(_)
            | CertError::DomainValidationFailed(_)
            | CertError::OrderFinalizationError(_)
            | CertError::PostUploadVerificationFailed(_)
            | CertError::Acme(_) => StatusCode::BAD_GATEWAY,
            CertError::ValidationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CertError::Configuration(_) | CertError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<SecretStoreError> for CertError {
    fn from(value: SecretStoreError) -> Self {
        CertError::StoreUnavailable(value.to_string())
    }
}

impl From<DnsError> for CertError {
    fn from(value: DnsError) -> Self {
        match value {
            DnsError::OutsideZone { domain, zone } => CertError::DomainOutsideZone { domain, zone },
            DnsError::UnknownProvider(provider) => CertError::Configuration(format!(
                "DNS provider '{provider}' has no registered implementation"
            )),
            DnsError::Cancelled => CertError::Cancelled,
            other => CertError::Internal(anyhow::anyhow!(other.to_string())),
        }
    }
}
