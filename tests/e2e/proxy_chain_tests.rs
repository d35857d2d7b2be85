//! Multi-hop proxy chains built through the public API

use anyhow::Result;
use assert_matches::assert_matches;
use chrono::Utc;
use gridproxy_auth::{
    Credential, CredentialKind, DelegationConstraints, DelegationError, FixedPassphrase,
    NoPassphrase, PolicyLanguage, PolicyRequest, TrustStore, VomsAcSequence,
};
use gridproxy_tests::{setup_test_logging, TestGrid};
use std::time::Duration;

fn with_language(language: PolicyLanguage) -> DelegationConstraints {
    DelegationConstraints::default().with_policy(PolicyRequest {
        language: Some(language),
        ..PolicyRequest::default()
    })
}

#[test]
fn limited_second_hop_keeps_identity_and_blocks_escalation() -> Result<()> {
    setup_test_logging();
    let grid = TestGrid::new();
    let alice = grid.user("Alice");

    let first = grid.delegate(
        &alice,
        &DelegationConstraints::default().with_lifetime(Duration::from_secs(12 * 3600)),
    )?;
    assert_eq!(first.policy().map(|p| p.language), Some(PolicyLanguage::InheritAll));

    let second = grid.delegate(&first, &with_language(PolicyLanguage::Limited))?;
    assert_eq!(second.kind(), CredentialKind::Proxy);
    assert_eq!(second.policy().map(|p| p.language), Some(PolicyLanguage::Limited));
    assert_eq!(second.identity_name().to_string(), "/O=Org/CN=Alice");
    assert_eq!(first.identity_name(), second.identity_name());

    let report = second.verify(&grid.trust())?;
    assert_eq!(report.proxy_depth, 2);
    assert_eq!(report.identity.to_string(), "/O=Org/CN=Alice");

    // Third hop may not regain inheritAll below a limited proxy
    assert_matches!(
        grid.delegate(&second, &with_language(PolicyLanguage::InheritAll)),
        Err(DelegationError::PolicyEscalation(_))
    );
    // Unspecified policy stays limited
    let third = grid.delegate(&second, &DelegationConstraints::default())?;
    assert_eq!(third.policy().map(|p| p.language), Some(PolicyLanguage::Limited));
    // Independent is allowed
    let independent = grid.delegate(&second, &with_language(PolicyLanguage::Independent))?;
    assert_eq!(independent.identity_name().to_string(), "/O=Org/CN=Alice");
    Ok(())
}

#[test]
fn proxy_subjects_extend_the_issuer_by_one_component() -> Result<()> {
    let grid = TestGrid::new();
    let alice = grid.user("Alice");
    let first = grid.delegate(&alice, &DelegationConstraints::default())?;
    let second = grid.delegate(&first, &DelegationConstraints::default())?;

    assert_eq!(first.subject().len(), alice.subject().len() + 1);
    assert_eq!(second.subject().len(), first.subject().len() + 1);
    assert_eq!(second.issuer(), first.subject());
    assert_eq!(second.chain().len(), 3);
    assert_ne!(first.serial(), second.serial());
    Ok(())
}

#[test]
fn child_validity_is_clipped_to_the_parent() -> Result<()> {
    let grid = TestGrid::new();
    let alice = grid.user("Alice");
    let short = grid.delegate(
        &alice,
        &DelegationConstraints::default().with_lifetime(Duration::from_secs(3600)),
    )?;
    let long = grid.delegate(
        &short,
        &DelegationConstraints::default().with_lifetime(Duration::from_secs(48 * 3600)),
    )?;
    assert!(long.end_time() <= short.end_time());
    assert!(long.start_time() >= short.start_time());
    long.verify(&grid.trust())?;
    Ok(())
}

#[test]
fn path_length_exhausts() -> Result<()> {
    let grid = TestGrid::new();
    let alice = grid.user("Alice");
    let one_more = grid.delegate(
        &alice,
        &DelegationConstraints::default().with_policy(PolicyRequest {
            path_length: Some(1),
            ..PolicyRequest::default()
        }),
    )?;
    let last = grid.delegate(&one_more, &DelegationConstraints::default())?;
    assert_eq!(last.policy().and_then(|p| p.path_length), Some(0));
    assert_matches!(
        grid.delegate(&last, &DelegationConstraints::default()),
        Err(DelegationError::SignerNotUsable(_))
    );
    Ok(())
}

#[test]
fn proxies_from_different_users_do_not_verify_as_each_other() -> Result<()> {
    let grid = TestGrid::new();
    let other_grid = TestGrid::new();
    let alice = grid.user("Alice");
    let proxy = grid.delegate(&alice, &DelegationConstraints::default())?;

    assert!(proxy.get_verification(&grid.trust()));
    assert!(!proxy.get_verification(&other_grid.trust()));
    assert!(!proxy.get_verification(&TrustStore::new()));
    Ok(())
}

#[test]
fn voms_attributes_ride_along() -> Result<()> {
    // SEQUENCE { SEQUENCE { INTEGER 5 } }
    let acs = VomsAcSequence::from_der(vec![0x30, 0x05, 0x30, 0x03, 0x02, 0x01, 0x05])?;
    let grid = TestGrid::new();
    let alice = grid.user("Alice");
    let proxy = grid.delegate(&alice, &DelegationConstraints::default().with_voms(acs.clone()))?;

    assert_eq!(proxy.voms_attributes(), Some(acs));
    let plain = grid.delegate(&proxy, &DelegationConstraints::default())?;
    assert_eq!(plain.voms_attributes(), None);
    Ok(())
}

#[test]
fn bundles_survive_the_filesystem() -> Result<()> {
    setup_test_logging();
    let grid = TestGrid::new();
    let alice = grid.user("Alice");
    let dir = tempfile::tempdir()?;

    // CA directory with a hashed file name and some noise
    let ca_dir = dir.path().join("certificates");
    std::fs::create_dir(&ca_dir)?;
    std::fs::write(ca_dir.join("1a2b3c4d.0"), grid.ca.credential().certificate_pem()?)?;
    std::fs::write(ca_dir.join("1a2b3c4d.signing_policy"), "access_id_CA X509 '/O=Org/CN=Test CA'")?;
    let trust = TrustStore::from_paths(None, Some(&ca_dir))?;
    assert_eq!(trust.len(), 1);

    // User credential with an encrypted key
    let user_file = dir.path().join("usercred.pem");
    std::fs::write(&user_file, alice.output_bundle_encrypted("correct horse")?.as_bytes())?;
    assert_matches!(
        Credential::load(&user_file, None, &NoPassphrase),
        Err(DelegationError::PassphraseFailure(_))
    );
    let loaded = Credential::load(&user_file, None, &FixedPassphrase::new("correct horse"))?;

    let proxy = grid.delegate(&loaded, &DelegationConstraints::default())?;
    let proxy_file = dir.path().join("x509up");
    std::fs::write(&proxy_file, proxy.output_bundle()?.as_bytes())?;

    let reread = Credential::load(&proxy_file, None, &NoPassphrase)?;
    assert!(reread.has_private_key());
    assert_eq!(reread.certificate(), proxy.certificate());
    let report = reread.verify(&trust)?;
    assert_eq!(report.identity.to_string(), "/O=Org/CN=Alice");
    assert!(report.verified_at <= Utc::now());

    // The reread proxy can sign the next hop
    let next = grid.delegate(&reread, &DelegationConstraints::default())?;
    next.verify(&trust)?;
    Ok(())
}
