use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use le_cert_manager::build_orchestrator_with;
use le_cert_manager::core::errors::CertError;
use le_cert_manager::core::types::CertificateRecord;
use le_cert_manager::issuance::dns::{DnsProviderKind, DnsProviderRegistry};
use le_cert_manager::issuance::dns_providers::MemoryDnsZoneClient;
use le_cert_manager::renewal::CertificateRenewalOrchestrator;
use le_cert_manager::secrets::memory::MemorySecretStore;
use le_cert_manager::settings::AppSettings;

use super::support::FakeCa;

const VAULT: &str = "https://vault.test/";

struct Harness {
    orchestrator: Arc<CertificateRenewalOrchestrator>,
    ca: Arc<FakeCa>,
    dns: Arc<MemoryDnsZoneClient>,
    store: Arc<MemorySecretStore>,
    dir: TempDir,
}

fn profile(name: &str, domains: &[&str], zone: &str) -> String {
    let domains = domains
        .iter()
        .map(|domain| format!("\"{domain}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"
[[certificates]]
name = "{name}"
domains = [{domains}]
acme_server = "staging"
[certificates.key_vault]
uri = "{VAULT}"
[certificates.dns_challenge]
provider = "memory"
settle_delay_secs = 0
[certificates.dns_challenge.zone]
name = "{zone}"
"#
    )
}

fn harness(zone: &str, profiles: &[String], policy: &str) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let raw = format!(
        r#"
renewal_before_expire_days = 20

[acme_account]
email = "ops@example.com"

[acme_key_cache]
backend = "file"
file_path = "{}"

[issuance]
poll_interval_secs = 1
validation_timeout_secs = 30
handler_error_policy = "{policy}"

[secret_store]
backend = "memory"
{}"#,
        dir.path().join("acme-account.json").display(),
        profiles.concat()
    );
    let settings = AppSettings::from_toml_str(&raw).expect("settings");

    let dns = Arc::new(MemoryDnsZoneClient::new());
    let ca = FakeCa::new(Arc::clone(&dns), zone);
    let store = Arc::new(MemorySecretStore::new());
    let registry = DnsProviderRegistry::new().register(DnsProviderKind::Memory, dns.clone());
    let orchestrator =
        build_orchestrator_with(settings, store.clone(), ca.clone(), registry).expect("wiring");
    Harness {
        orchestrator,
        ca,
        dns,
        store,
        dir,
    }
}

fn record_expiring_in(days: i64) -> CertificateRecord {
    let mut params =
        rcgen::CertificateParams::new(vec!["example.com".to_string()]).expect("params");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "example.com");
    let key = rcgen::KeyPair::generate().expect("key");
    let cert = params.self_signed(&key).expect("cert");
    let mut record = CertificateRecord::from_der("example", cert.der()).expect("record");
    record.expires = Utc::now() + Duration::days(days);
    record
}

#[tokio::test]
async fn cold_start_renewal_issues_and_uploads() {
    let h = harness(
        "example.com",
        &[profile("example", &["example.com"], "example.com")],
        "skip",
    );

    let record = h
        .orchestrator
        .renew("example", false, &CancellationToken::new())
        .await
        .expect("renew")
        .expect("issued");

    assert_eq!(record.name, "example");
    assert!(record.subject.contains("example.com"));
    assert_eq!(record.subject_alternative_names, vec!["example.com".to_string()]);
    assert!(record.issuer_name.contains("Fake Test Root"));
    assert!(!record.is_expiring_within(Duration::days(20)));
    assert_eq!(h.store.import_count(), 1);
    assert_eq!(h.ca.accounts_created(), 1);

    let txt = h
        .dns
        .record("example.com", "_acme-challenge")
        .expect("challenge record");
    assert_eq!(txt.values.len(), 1);
    assert_eq!(txt.order_id.as_deref(), Some("fake-order-0"));
    assert!(h.dir.path().join("acme-account.staging.json").exists());

    let fetched = h.orchestrator.get_certificate("example").await.expect("get");
    assert_eq!(fetched.thumbprint, record.thumbprint);
}

#[tokio::test]
async fn second_renewal_reuses_cached_account() {
    let h = harness(
        "example.com",
        &[profile("example", &["example.com"], "example.com")],
        "skip",
    );
    let cancel = CancellationToken::new();

    h.orchestrator.renew("example", true, &cancel).await.expect("first");
    h.orchestrator.renew("example", true, &cancel).await.expect("second");

    assert_eq!(h.ca.accounts_created(), 1);
    assert_eq!(h.ca.accounts_restored(), 1);
    assert_eq!(h.ca.orders(), 2);
    assert_eq!(h.store.import_count(), 2);
}

#[tokio::test]
async fn healthy_certificate_is_left_alone() {
    let h = harness(
        "example.com",
        &[profile("example", &["example.com"], "example.com")],
        "skip",
    );
    h.store
        .insert_certificate("example", VAULT, record_expiring_in(25));

    let outcome = h
        .orchestrator
        .renew("example", false, &CancellationToken::new())
        .await
        .expect("renew");

    assert!(outcome.is_none());
    assert_eq!(h.store.import_count(), 0);
    assert_eq!(h.ca.accounts_created(), 0);
    assert_eq!(h.ca.orders(), 0);
}

#[tokio::test]
async fn challenge_record_names_follow_zone_position() {
    let h = harness(
        "contoso.com",
        &[profile("contoso", &["contoso.com", "sub.contoso.com"], "contoso.com")],
        "skip",
    );

    let record = h
        .orchestrator
        .renew("contoso", false, &CancellationToken::new())
        .await
        .expect("renew")
        .expect("issued");

    assert!(h.dns.record("contoso.com", "_acme-challenge").is_some());
    assert!(h.dns.record("contoso.com", "_acme-challenge.sub").is_some());
    assert_eq!(
        record.subject_alternative_names,
        vec!["contoso.com".to_string(), "sub.contoso.com".to_string()]
    );
    assert_eq!(
        h.store.friendly_name("contoso", VAULT).as_deref(),
        Some("contoso.com")
    );
}

#[tokio::test]
async fn apex_and_wildcard_share_one_record() {
    let h = harness(
        "example.com",
        &[profile("example", &["example.com", "*.example.com"], "example.com")],
        "skip",
    );

    h.orchestrator
        .renew("example", false, &CancellationToken::new())
        .await
        .expect("renew")
        .expect("issued");

    let txt = h
        .dns
        .record("example.com", "_acme-challenge")
        .expect("challenge record");
    assert_eq!(txt.values.len(), 2);
    assert_ne!(txt.values[0], txt.values[1]);
}

#[tokio::test]
async fn domain_outside_zone_depends_on_handler_policy() {
    let profiles = [profile("stray", &["example.org"], "example.com")];

    let skip = harness("example.com", &profiles, "skip");
    let err = skip
        .orchestrator
        .renew("stray", false, &CancellationToken::new())
        .await
        .expect_err("must fail");
    assert!(matches!(err, CertError::AuthorizationUnsatisfiable(ref domain) if domain == "example.org"));
    assert_eq!(skip.store.import_count(), 0);

    let fail_fast = harness("example.com", &profiles, "fail_fast");
    let err = fail_fast
        .orchestrator
        .renew("stray", false, &CancellationToken::new())
        .await
        .expect_err("must fail");
    assert!(matches!(err, CertError::DomainOutsideZone { .. }));
    assert_eq!(err.status_code(), hyper::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn sweep_isolates_failing_profile() {
    let h = harness(
        "example.com",
        &[
            profile("example", &["example.com"], "example.com"),
            profile("healthy", &["www.example.com"], "example.com"),
            profile("stray", &["example.org"], "example.com"),
        ],
        "skip",
    );
    h.store
        .insert_certificate("healthy", VAULT, record_expiring_in(60));

    let report = h.orchestrator.renew_all_due(&CancellationToken::new()).await;

    assert_eq!(report.renewed, vec!["example".to_string()]);
    assert_eq!(report.skipped, vec!["healthy".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "stray");
    assert_eq!(h.store.import_count(), 1);
}
