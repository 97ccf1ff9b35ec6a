use anyhow::{Context, Result, anyhow};
use openssl::{pkcs12::Pkcs12, pkey::PKey, stack::Stack, x509::X509};
use pem::Pem;
use rcgen::{CertificateParams, DnType, KeyPair};
use zeroize::Zeroizing;

/// Certificate signing request plus the freshly generated private key behind it.
pub struct CsrMaterial {
    pub csr_der: Vec<u8>,
    pub key_pem: Zeroizing<String>,
}

/// Builds a CSR for `domains` over a new ECDSA P-256 key; the first domain is the CN.
pub fn build_csr(domains: &[String]) -> Result<CsrMaterial> {
    let common_name = domains
        .first()
        .ok_or_else(|| anyhow!("at least one domain is required for a CSR"))?;
    let mut params =
        CertificateParams::new(domains.to_vec()).context("failed to create CSR parameters")?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name.as_str());
    let key = KeyPair::generate().context("failed to generate certificate key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize CSR")?;
    Ok(CsrMaterial {
        csr_der: csr.der().to_vec(),
        key_pem: Zeroizing::new(key.serialize_pem()),
    })
}

/// Splits a PEM chain into the leaf and the issuer certificates that follow it.
pub fn split_chain(chain_pem: &str) -> Result<(X509, Vec<X509>)> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let mut certs = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block: Pem| X509::from_der(block.contents()))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to decode certificate in chain")?
        .into_iter();
    let leaf = certs
        .next()
        .ok_or_else(|| anyhow!("no certificate PEM blocks found"))?;
    Ok((leaf, certs.collect()))
}

/// Password-protected PKCS#12 archive of the key, the leaf and its issuers.
pub fn build_pfx(chain_pem: &str, key_pem: &str, password: &str, friendly_name: &str) -> Result<Vec<u8>> {
    let (leaf, intermediates) = split_chain(chain_pem)?;
    let pkey = PKey::private_key_from_pem(key_pem.as_bytes())
        .context("failed to load certificate private key")?;
    if !leaf
        .public_key()
        .map(|public| public.public_eq(&pkey))
        .unwrap_or(false)
    {
        return Err(anyhow!("issued certificate does not match the generated key"));
    }

    let mut builder = Pkcs12::builder();
    builder.name(friendly_name).pkey(&pkey).cert(&leaf);
    if !intermediates.is_empty() {
        let mut stack = Stack::new().context("failed to allocate certificate stack")?;
        for cert in intermediates {
            stack.push(cert).context("failed to add issuer certificate")?;
        }
        builder.ca(stack);
    }
    let pfx = builder
        .build2(password)
        .context("failed to build PKCS#12 archive")?;
    pfx.to_der().context("failed to encode PKCS#12 archive")
}
