//! Delegation Endpoint
//!
//! Client side of network delegation: ask the remote service for a request,
//! sign it locally, send the signed proxy back.

use crate::delegation::DelegationProvider;
use crate::error::{DelegationError, Result};
use crate::request::DelegationConstraints;
use crate::service::{
    DelegationFault, DelegationService, InitRequest, InitResponse, UpdateRequest, UpdateResponse,
};
use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path of the `DelegateCredentialsInit` operation
pub const INIT_PATH: &str = "/delegation/v1/init";

/// Path of the `UpdateCredentials` operation
pub const UPDATE_PATH: &str = "/delegation/v1/update";

/// Carries the two delegation operations to a service
#[async_trait]
pub trait DelegationTransport: Send + Sync {
    /// `DelegateCredentialsInit`
    async fn init(&self, request: &InitRequest) -> Result<InitResponse>;

    /// `UpdateCredentials`
    async fn update(&self, request: &UpdateRequest) -> Result<UpdateResponse>;
}

/// JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Transport for the service at `base`. Operation paths are resolved
    /// below the base path, so `https://host/arc` reaches
    /// `https://host/arc/delegation/v1/init`.
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base)
            .map_err(|e| DelegationError::Config(format!("invalid service URL {}: {}", base, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DelegationError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| DelegationError::Config(format!("invalid service path {}: {}", path, e)))?;
        debug!("POST {}", url);

        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        match serde_json::from_slice::<DelegationFault>(&bytes) {
            Ok(fault) => Err(fault.into_error()),
            Err(_) => Err(DelegationError::NoResponse(format!(
                "service returned status {} without a fault body",
                status
            ))),
        }
    }
}

#[async_trait]
impl DelegationTransport for HttpTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        self.call(INIT_PATH, request).await
    }

    async fn update(&self, request: &UpdateRequest) -> Result<UpdateResponse> {
        self.call(UPDATE_PATH, request).await
    }
}

/// Calls a service in the same process, on the blocking pool
#[derive(Debug, Clone)]
pub struct LocalTransport {
    service: Arc<DelegationService>,
}

impl LocalTransport {
    /// Transport for `service`
    pub fn new(service: Arc<DelegationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl DelegationTransport for LocalTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        let service = self.service.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || service.delegate_credentials_init(&request))
            .await
            .map_err(|e| DelegationError::Internal(format!("init task failed: {}", e)))?
    }

    async fn update(&self, request: &UpdateRequest) -> Result<UpdateResponse> {
        let service = self.service.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || service.update_credentials(&request))
            .await
            .map_err(|e| DelegationError::Internal(format!("update task failed: {}", e)))?
    }
}

/// Delegates a local credential to a remote service
pub struct DelegationEndpoint<T: DelegationTransport> {
    transport: T,
}

impl<T: DelegationTransport> DelegationEndpoint<T> {
    /// Endpoint over `transport`
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Run Init, sign, Update.
    ///
    /// When Update gets no response the remote session is left `Pending` to
    /// expire on its own; the error reports as an unknown session.
    pub async fn delegate(
        &self,
        provider: &DelegationProvider,
        init: &InitRequest,
        constraints: &DelegationConstraints,
    ) -> Result<UpdateResponse> {
        let InitResponse {
            session_id,
            request,
        } = self.transport.init(init).await?;
        debug!("Delegation session {} opened", session_id);

        let signer = provider.clone();
        let constraints = constraints.clone();
        let bundle = tokio::task::spawn_blocking(move || signer.delegate(&request, &constraints))
            .await
            .map_err(|e| DelegationError::Internal(format!("signing task failed: {}", e)))??;
        let update = UpdateRequest {
            session_id: session_id.clone(),
            bundle,
        };
        match self.transport.update(&update).await {
            Ok(response) => {
                info!(
                    "Delegated {} to session {}",
                    response.identity, response.session_id
                );
                Ok(response)
            }
            Err(e) => {
                if matches!(e, DelegationError::NoResponse(_)) {
                    warn!("No response for session {}; leaving it to expire", session_id);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::CertificateAuthority;
    use crate::cache::DelegationSessionCache;
    use crate::config::{CacheConfig, KeyConfig};
    use crate::request::{CredentialRequest, RequestParams};
    use chrono::Utc;

    fn keys() -> KeyConfig {
        KeyConfig {
            default_bits: 1024,
            ..KeyConfig::default()
        }
    }

    fn provider() -> (CertificateAuthority, DelegationProvider) {
        let ca = CertificateAuthority::self_signed(
            &"/O=Grid/CN=Test CA".parse().unwrap(),
            chrono::Duration::days(1),
            1024,
        )
        .unwrap();
        let alice = ca
            .issue_end_entity(&"/O=Grid/CN=Alice".parse().unwrap(), chrono::Duration::hours(12), 1024)
            .unwrap();
        (ca, DelegationProvider::new(alice).unwrap())
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let (ca, provider) = provider();
        let service = Arc::new(DelegationService::new(
            Arc::new(DelegationSessionCache::new(CacheConfig::default())),
            Arc::new(ca.trust_store()),
            keys(),
        ));
        let endpoint = DelegationEndpoint::new(LocalTransport::new(service.clone()));

        let response = endpoint
            .delegate(&provider, &InitRequest::default(), &DelegationConstraints::default())
            .await
            .unwrap();
        assert_eq!(response.identity.to_string(), "/O=Grid/CN=Alice");
        assert!(service.credential(&response.session_id).is_ok());
    }

    #[tokio::test]
    async fn test_http_fault_is_typed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", UPDATE_PATH)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"unknown_session","message":"Unknown delegation session: abc"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let result = transport
            .update(&UpdateRequest {
                session_id: "abc".to_string(),
                bundle: String::new(),
            })
            .await;
        assert!(matches!(result, Err(DelegationError::UnknownSession(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_delegation() {
        let (_, provider) = provider();
        let pending = CredentialRequest::generate(&RequestParams::default(), &keys()).unwrap();
        let init = InitResponse {
            session_id: "session-1".to_string(),
            request: pending.request().clone(),
        };
        let update = UpdateResponse {
            session_id: "session-1".to_string(),
            identity: "/O=Grid/CN=Alice".parse().unwrap(),
            expires_at: Utc::now(),
        };

        let mut server = mockito::Server::new_async().await;
        let init_mock = server
            .mock("POST", INIT_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&init).unwrap())
            .create_async()
            .await;
        let update_mock = server
            .mock("POST", UPDATE_PATH)
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"session_id":"session-1"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::to_string(&update).unwrap())
            .create_async()
            .await;

        let endpoint =
            DelegationEndpoint::new(HttpTransport::new(&server.url(), Duration::from_secs(5)).unwrap());
        let response = endpoint
            .delegate(&provider, &InitRequest::default(), &DelegationConstraints::default())
            .await
            .unwrap();
        assert_eq!(response, update);
        init_mock.assert_async().await;
        update_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_base_path_is_kept() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/arc/delegation/v1/update")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"unknown_session","message":"gone"}"#)
            .expect(2)
            .create_async()
            .await;

        for base in [format!("{}/arc", server.url()), format!("{}/arc/", server.url())] {
            let transport = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
            let result = transport
                .update(&UpdateRequest {
                    session_id: "abc".to_string(),
                    bundle: String::new(),
                })
                .await;
            assert!(matches!(result, Err(DelegationError::UnknownSession(_))));
        }
        mock.assert_async().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_signing_off_the_executor() {
        let (ca, provider) = provider();
        let service = Arc::new(DelegationService::new(
            Arc::new(DelegationSessionCache::new(CacheConfig::default())),
            Arc::new(ca.trust_store()),
            keys(),
        ));
        let endpoint = DelegationEndpoint::new(LocalTransport::new(service.clone()));

        let (req1, cons1) = (InitRequest::default(), DelegationConstraints::default());
        let (req2, cons2) = (InitRequest::default(), DelegationConstraints::default());
        let (first, second) = tokio::join!(
            endpoint.delegate(&provider, &req1, &cons1),
            endpoint.delegate(&provider, &req2, &cons2),
        );
        assert_ne!(first.unwrap().session_id, second.unwrap().session_id);
        assert_eq!(service.cache().counts().active, 2);
    }

    #[tokio::test]
    async fn test_http_error_without_fault_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", INIT_PATH)
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let transport = HttpTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = transport.init(&InitRequest::default()).await.unwrap_err();
        assert!(matches!(err, DelegationError::NoResponse(_)));
        assert!(err.is_unknown_session());
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Port 9 (discard) is closed on test hosts
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = transport.init(&InitRequest::default()).await.unwrap_err();
        assert!(err.is_unknown_session());
    }
}
