//! Turnstile `siteverify` client tests against a local mock server.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use vidgrab::{
    config::VerificationConfig,
    verification::{ChallengeVerifier, TurnstileVerifier, VerificationError, VerificationGate},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

async fn verifier_for(server: &MockServer) -> TurnstileVerifier {
    TurnstileVerifier::new(
        format!("{}/turnstile/v0/siteverify", server.uri()),
        Duration::from_secs(2),
    )
    .expect("http client")
}

#[tokio::test]
async fn successful_siteverify_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/turnstile/v0/siteverify"))
        .and(body_string_contains("secret=s3cret"))
        .and(body_string_contains("response=tok"))
        .and(body_string_contains("remoteip=203.0.113.7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "error-codes": [],
            "hostname": "grab.example.com"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = verifier_for(&server)
        .await
        .siteverify("s3cret", "tok", "203.0.113.7")
        .await
        .expect("siteverify response");

    assert!(response.success);
    assert!(response.error_codes.is_empty());
    assert_eq!(response.hostname.as_deref(), Some("grab.example.com"));
}

#[tokio::test]
async fn rejected_token_surfaces_error_codes_through_gate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/turnstile/v0/siteverify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error-codes": ["invalid-input-response"]
        })))
        .mount(&server)
        .await;

    let config = VerificationConfig {
        enabled: true,
        secret_key: Some("s3cret".to_string()),
        ..VerificationConfig::default()
    };
    let gate = VerificationGate::new(config, Arc::new(verifier_for(&server).await));

    let error = gate
        .verify(Some("forged"), "203.0.113.7")
        .await
        .expect_err("token should be rejected");

    match error {
        VerificationError::Rejected { codes } => {
            assert_eq!(codes, vec!["invalid-input-response".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn provider_outage_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/turnstile/v0/siteverify"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let error = verifier_for(&server)
        .await
        .siteverify("s3cret", "tok", "203.0.113.7")
        .await
        .expect_err("outage should fail");

    assert!(matches!(error, VerificationError::Unavailable(_)));
}

#[tokio::test]
async fn garbled_provider_body_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/turnstile/v0/siteverify"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let error = verifier_for(&server)
        .await
        .siteverify("s3cret", "tok", "203.0.113.7")
        .await
        .expect_err("non-json body should fail");

    assert!(matches!(error, VerificationError::Unavailable(_)));
}
