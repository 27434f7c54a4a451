//! Provider bootstrap staging, caching and failure reporting

use serde_json::json;
use tempfile::tempdir;
use tokio_test::assert_ok;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use eipc_core::error::BootstrapError;
use eipc_core::provider::bootstrap::BootstrapStage;
use eipc_core::provider::{Bootstrap, ProviderBootstrap};
use eipc_core::vpn::{Bus, TunnelEvent};

fn provider_json() -> serde_json::Value {
    json!({
        "domain": "localhost",
        "api_version": "1",
        "services": ["tunnel", "mail"],
        "gateways": ["198.51.100.7:1194"]
    })
}

async fn mount_happy_provider(server: &MockServer, meta: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ca.crt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"FAKE CA CERTIFICATE".to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/provider.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(meta))
        .mount(server)
        .await;
}

fn bootstrap_for(server: &MockServer, config_dir: &std::path::Path) -> ProviderBootstrap {
    ProviderBootstrap::new(config_dir.to_path_buf())
        .unwrap()
        .with_base_url(Url::parse(&server.uri()).unwrap())
}

#[tokio::test]
async fn full_bootstrap_loads_and_persists_the_provider() {
    let server = MockServer::start().await;
    mount_happy_provider(&server, provider_json()).await;
    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    let config = tokio_test::assert_ok!(bootstrap.ensure("localhost").await);

    assert!(config.loaded());
    assert!(config.provides_tunnel());
    assert!(config.provides_mail());
    assert_eq!(config.gateways(), &["198.51.100.7:1194".to_string()]);

    // Certificate and metadata were persisted for later sessions
    let provider_dir = dir.path().join("providers").join("localhost");
    assert!(provider_dir.join("ca.crt").exists());
    assert!(provider_dir.join("provider.json").exists());

    let provisional = bootstrap.load_cached("localhost").unwrap();
    assert!(provisional.loaded());
    assert!(provisional.provides_tunnel());
    assert!(provisional.ca_cert_path().is_some());
}

#[tokio::test]
async fn repeated_ensure_uses_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ca.crt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"FAKE".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/provider.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(provider_json()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    let first = bootstrap.ensure("localhost").await.unwrap();
    let second = bootstrap.ensure("localhost").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn invalidate_forces_a_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ca.crt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"FAKE".to_vec()))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/provider.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(provider_json()))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    bootstrap.ensure("localhost").await.unwrap();
    bootstrap.invalidate("localhost");
    bootstrap.ensure("localhost").await.unwrap();
}

#[tokio::test]
async fn missing_ca_certificate_names_the_failed_stage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ca.crt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let bus = Bus::new(32);
    let mut events = bus.subscribe();
    let bootstrap = bootstrap_for(&server, dir.path()).with_events(bus);

    let err = bootstrap.ensure("localhost").await.unwrap_err();
    assert!(matches!(err, BootstrapError::Certificate { .. }));

    // The stage progression was reported: two successes, then the failure
    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::BootstrapStage { stage, ok, .. } = event {
            stages.push((stage, ok));
        }
    }
    assert_eq!(
        stages,
        vec![
            (BootstrapStage::NameResolution, true),
            (BootstrapStage::TransportHandshake, true),
            (BootstrapStage::CaCertificate, false),
        ]
    );
}

#[tokio::test]
async fn unsupported_api_version_is_rejected() {
    let server = MockServer::start().await;
    let mut meta = provider_json();
    meta["api_version"] = json!("99");
    mount_happy_provider(&server, meta).await;

    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    let err = bootstrap.ensure("localhost").await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::UnsupportedApi { ref got, .. } if got == "99"
    ));
}

#[tokio::test]
async fn too_old_client_is_rejected() {
    let server = MockServer::start().await;
    let mut meta = provider_json();
    meta["minimum_client_version"] = json!("99.0.0");
    mount_happy_provider(&server, meta).await;

    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    let err = bootstrap.ensure("localhost").await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::UnsupportedClient { ref required, .. } if required == "99.0.0"
    ));
}

#[tokio::test]
async fn unresolvable_domain_fails_name_resolution() {
    let server = MockServer::start().await;
    mount_happy_provider(&server, provider_json()).await;

    let dir = tempdir().unwrap();
    let bootstrap = bootstrap_for(&server, dir.path());

    let err = bootstrap
        .ensure("eipc-no-such-host.invalid")
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::NameResolution { .. }));
}

#[tokio::test]
async fn unreachable_endpoint_fails_the_transport_stage() {
    let dir = tempdir().unwrap();
    // Nothing listens on the discard port
    let bootstrap = ProviderBootstrap::new(dir.path().to_path_buf())
        .unwrap()
        .with_base_url(Url::parse("http://127.0.0.1:9/").unwrap());

    let err = bootstrap.ensure("localhost").await.unwrap_err();
    assert!(matches!(err, BootstrapError::Transport { .. }));
}

#[tokio::test]
async fn load_cached_without_prior_bootstrap_fails() {
    let dir = tempdir().unwrap();
    let bootstrap = ProviderBootstrap::new(dir.path().to_path_buf()).unwrap();

    let err = bootstrap.load_cached("localhost").unwrap_err();
    assert!(matches!(err, BootstrapError::NoCachedConfig { .. }));
}
