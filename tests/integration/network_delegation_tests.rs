//! Init/Update handshakes against an in-process delegation service

use anyhow::Result;
use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;
use gridproxy_auth::config::CacheConfig;
use gridproxy_auth::service::{InitRequest, UpdateRequest};
use gridproxy_auth::{
    DelegationConstraints, DelegationEndpoint, DelegationError, DelegationProvider,
    LocalTransport, ManualClock, SessionState,
};
use gridproxy_tests::{setup_test_logging, TestGrid};
use std::sync::Arc;
use std::time::Duration;

fn bounded(per_identity: usize) -> CacheConfig {
    CacheConfig {
        max_credentials_per_identity: per_identity,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn delegation_over_local_transport() -> Result<()> {
    setup_test_logging();
    let grid = TestGrid::new();
    let service = grid.service(bounded(10));
    let alice = grid.user("Alice");
    let proxy = grid.delegate(&alice, &DelegationConstraints::default())?;

    // Delegate from a proxy, not the EEC: the identity is still Alice
    let endpoint = DelegationEndpoint::new(LocalTransport::new(service.clone()));
    let response = endpoint
        .delegate(
            &DelegationProvider::new(proxy)?,
            &InitRequest {
                lifetime: Some(Duration::from_secs(1800)),
                ..InitRequest::default()
            },
            &DelegationConstraints::default(),
        )
        .await?;
    assert_eq!(response.identity, alice.identity_name());

    let stored = service.credential(&response.session_id)?;
    assert!(stored.has_private_key());
    assert_eq!(stored.chain().len(), 3);
    stored.verify(service.trust())?;

    let by_identity = service.credentials_for(&alice.identity_name());
    assert_eq!(by_identity.len(), 1);
    assert_eq!(by_identity[0].certificate(), stored.certificate());
    Ok(())
}

#[test]
fn update_is_single_use() -> Result<()> {
    let grid = TestGrid::new();
    let service = grid.service(bounded(10));
    let provider = DelegationProvider::new(grid.user("Alice"))?;

    let init = service.delegate_credentials_init(&InitRequest::default())?;
    let update = UpdateRequest {
        session_id: init.session_id.clone(),
        bundle: provider.delegate(&init.request, &DelegationConstraints::default())?,
    };
    service.update_credentials(&update)?;
    assert_matches!(
        service.update_credentials(&update),
        Err(DelegationError::UnknownSession(_))
    );

    let never_issued = UpdateRequest {
        session_id: "00000000-0000-0000-0000-000000000000".to_string(),
        bundle: update.bundle.clone(),
    };
    assert_matches!(
        service.update_credentials(&never_issued),
        Err(DelegationError::UnknownSession(_))
    );
    Ok(())
}

#[test]
fn wrong_key_leaves_session_pending() -> Result<()> {
    let grid = TestGrid::new();
    let service = grid.service(bounded(10));
    let provider = DelegationProvider::new(grid.user("Alice"))?;

    let first = service.delegate_credentials_init(&InitRequest::default())?;
    let second = service.delegate_credentials_init(&InitRequest::default())?;

    // Certificate for the first session's key sent to the second session
    let misdirected = UpdateRequest {
        session_id: second.session_id.clone(),
        bundle: provider.delegate(&first.request, &DelegationConstraints::default())?,
    };
    assert_matches!(
        service.update_credentials(&misdirected),
        Err(DelegationError::KeyMismatch)
    );
    assert_eq!(
        service.cache().session_state(&second.session_id),
        Some(SessionState::Pending)
    );

    service.update_credentials(&UpdateRequest {
        session_id: second.session_id.clone(),
        bundle: provider.delegate(&second.request, &DelegationConstraints::default())?,
    })?;
    assert_eq!(
        service.cache().session_state(&second.session_id),
        Some(SessionState::Active)
    );
    Ok(())
}

#[test]
fn per_identity_bound_drops_the_oldest() -> Result<()> {
    let grid = TestGrid::new();
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let service = grid.service_with_clock(bounded(2), clock.clone());
    let alice = grid.user("Alice");
    let provider = DelegationProvider::new(alice.clone())?;

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let init = service.delegate_credentials_init(&InitRequest::default())?;
        let response = service.update_credentials(&UpdateRequest {
            session_id: init.session_id,
            bundle: provider.delegate(&init.request, &DelegationConstraints::default())?,
        })?;
        sessions.push(response.session_id);
        clock.advance(ChronoDuration::seconds(5));
    }

    let retained = service.credentials_for(&alice.identity_name());
    assert_eq!(retained.len(), 2);
    assert_matches!(
        service.credential(&sessions[0]),
        Err(DelegationError::UnknownSession(_))
    );
    let newest = service.credential(&sessions[2])?;
    assert_eq!(retained[0].certificate(), newest.certificate());
    assert_eq!(retained[1].certificate(), service.credential(&sessions[1])?.certificate());
    Ok(())
}

#[test]
fn expired_sessions_disappear() -> Result<()> {
    let grid = TestGrid::new();
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let service = grid.service_with_clock(
        CacheConfig {
            max_credential_lifetime: Duration::from_secs(3600),
            ..CacheConfig::default()
        },
        clock.clone(),
    );
    let alice = grid.user("Alice");
    let provider = DelegationProvider::new(alice.clone())?;

    let init = service.delegate_credentials_init(&InitRequest::default())?;
    let response = service.update_credentials(&UpdateRequest {
        session_id: init.session_id,
        bundle: provider.delegate(&init.request, &DelegationConstraints::default())?,
    })?;
    assert_eq!(service.credentials_for(&alice.identity_name()).len(), 1);

    clock.advance(ChronoDuration::minutes(61));
    assert!(service.credentials_for(&alice.identity_name()).is_empty());
    assert_matches!(
        service.credential(&response.session_id),
        Err(DelegationError::CredentialExpired(_))
    );

    // A pending session that never completes is swept
    let abandoned = service.delegate_credentials_init(&InitRequest::default())?;
    clock.advance(ChronoDuration::minutes(10));
    let report = service.sweep();
    assert_eq!(report.expired_pending, 1);
    assert_matches!(
        service.update_credentials(&UpdateRequest {
            session_id: abandoned.session_id,
            bundle: String::new(),
        }),
        Err(DelegationError::UnknownSession(_))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_handshakes() -> Result<()> {
    let grid = TestGrid::new();
    let service = grid.service(bounded(16));
    let provider = Arc::new(DelegationProvider::new(grid.user("Alice"))?);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let endpoint = DelegationEndpoint::new(LocalTransport::new(service.clone()));
        let provider = provider.clone();
        tasks.push(tokio::spawn(async move {
            endpoint
                .delegate(&provider, &InitRequest::default(), &DelegationConstraints::default())
                .await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        let response = task.await??;
        ids.insert(response.session_id);
    }
    assert_eq!(ids.len(), 8);
    let counts = service.cache().counts();
    assert_eq!(counts.active, 8);
    assert_eq!(counts.pending, 0);
    Ok(())
}
