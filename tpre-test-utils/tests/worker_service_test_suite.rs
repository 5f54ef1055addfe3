//! Endpoint-level tests against real worker nodes.


use std::sync::Arc;
use std::time::Duration;

use setup::TestNet;
use tpre_client::{TransportError, WorkerApiClient};
use tpre_fleet::transport::{HttpMetadataExchange, MetadataExchange as _};
use tpre_test_utils::{
    TEST_TIMEOUT, TestOracle, TestWorker, TestWorkerOptions, TextConditionEvaluator,
    learned_fleet,
};
use tpre_types::api::{
    Condition, EnactmentRequest, NodeMetadataRequest, PROTOCOL_VERSION_HEADER, ReencryptionRequest,
    StatusResponse, error_codes,
};
use tpre_types::crypto::EncryptedKeyFrag;
use tpre_types::policy::Policy;
use tpre_types::wire::{Envelope, MessageKind};
use tpre_types::{Hrac, Timestamp};
use uuid::Uuid;

const CALL_DEADLINE: Duration = Duration::from_secs(10);

/// Grants a 1-of-1 policy against the first worker and returns everything a
/// re-encryption request needs.
async fn one_of_one_grant(
    net: &TestNet,
    label: &str,
) -> (
    tpre_core::keys::DelegatorKeys,
    tpre_core::keys::RetrieverKeys,
    Policy,
) {
    let (delegator_keys, delegator) = setup::delegator(label.as_bytes());
    let (retriever_keys, _) = setup::retriever(label.as_bytes());
    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            label,
            1,
            1,
            Timestamp::now().saturating_add(Duration::from_secs(3600)),
        )
        .await
        .expect("grant succeeds");
    (delegator_keys, retriever_keys, outcome.policy)
}

fn reencryption_request(
    policy: &Policy,
    retriever_keys: &tpre_core::keys::RetrieverKeys,
    plaintext: &[u8],
    conditions: Vec<Option<Condition>>,
) -> (ReencryptionRequest, Vec<u8>) {
    let (capsule, ciphertext) =
        tpre_core::encrypt(&policy.encrypted_payload_pk, plaintext).expect("encrypts");
    let request = ReencryptionRequest {
        request_id: Uuid::new_v4(),
        hrac: policy.hrac,
        retriever_verifying_pk: retriever_keys.verifying_pk().clone(),
        retriever_decryption_pk: retriever_keys.decryption_pk().clone(),
        capsules: vec![capsule],
        conditions,
    };
    (request, ciphertext)
}

#[tokio::test]
async fn health_and_status_report_the_node() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let http = reqwest::Client::new();

    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let response = http
                .get(format!("{}/health", worker.base_url))
                .send()
                .await
                .expect("health reachable");
            if response.status().is_success() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("worker becomes healthy");

    let status: StatusResponse = http
        .get(format!("{}/status", worker.base_url))
        .send()
        .await
        .expect("status reachable")
        .json()
        .await
        .expect("status is json");
    assert_eq!(status.node_id, worker.metadata.node_id);
    assert_eq!(status.domain, tpre_test_utils::test_domain());
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn public_information_is_self_signed() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let info = WorkerApiClient::new()
        .public_information(&worker.base_url, CALL_DEADLINE)
        .await
        .expect("info reachable");
    assert_eq!(info.metadata, worker.metadata);
    info.metadata
        .verify(Timestamp::now())
        .expect("identity verifies on its own");
}

#[tokio::test]
async fn metadata_exchange_announces_the_fleet() {
    let net = TestNet::spawn(2).await.expect("net spawns");
    let worker = &net.workers[0];
    let exchange = HttpMetadataExchange::new("0.3.0".parse().expect("version"));

    let reply = exchange
        .exchange(
            &worker.base_url,
            NodeMetadataRequest {
                announcer: None,
                fleet_checksum: None,
            },
        )
        .await
        .expect("exchange succeeds");
    assert_eq!(reply.responder, worker.metadata);

    // announcing the responder's own checksum suppresses the full list
    let short_reply = exchange
        .exchange(
            &worker.base_url,
            NodeMetadataRequest {
                announcer: None,
                fleet_checksum: Some(reply.checksum),
            },
        )
        .await
        .expect("exchange succeeds");
    assert!(short_reply.fleet.is_empty());
    assert_eq!(short_reply.checksum, reply.checksum);
}

#[tokio::test]
async fn workers_discover_each_other_through_seed_peers() {
    let oracle = Arc::new(TestOracle::new());
    let evaluator: tpre_types::api::ConditionEvaluatorService = Arc::new(TextConditionEvaluator);

    let mut options_a = TestWorkerOptions::new(0, oracle.clone(), evaluator.clone());
    options_a.learning_interval = Duration::from_millis(200);
    let worker_a = TestWorker::start_with(options_a).await.expect("a spawns");
    oracle.authorize(&worker_a.metadata);

    let mut options_b = TestWorkerOptions::new(1, oracle.clone(), evaluator.clone());
    options_b.learning_interval = Duration::from_millis(200);
    options_b.seed_peers = vec![worker_a.base_url.clone()];
    let worker_b = TestWorker::start_with(options_b).await.expect("b spawns");
    oracle.authorize(&worker_b.metadata);

    let http = reqwest::Client::new();
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let status_a: StatusResponse = http
                .get(format!("{}/status", worker_a.base_url))
                .send()
                .await
                .expect("status reachable")
                .json()
                .await
                .expect("status is json");
            let status_b: StatusResponse = http
                .get(format!("{}/status", worker_b.base_url))
                .send()
                .await
                .expect("status reachable")
                .json()
                .await
                .expect("status is json");
            if status_a.known_nodes >= 1 && status_b.known_nodes >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("both directions learned");

    worker_a.shutdown();
    worker_b.shutdown();
}

#[tokio::test]
async fn reencrypt_round_trip_through_one_worker() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "round/trip").await;

    let (request, ciphertext) =
        reencryption_request(&policy, &retriever_keys, b"peace at dawn", Vec::new());
    let response = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect("worker serves");

    let verified = tpre_core::verify_cfrag(
        response.cfrags[0].clone(),
        &request.capsules[0],
        &policy.delegator_verifying_pk,
        &policy.encrypted_payload_pk,
        &policy.retriever_decryption_pk,
    )
    .expect("proof verifies");
    let plaintext = tpre_core::decrypt_reencrypted(
        retriever_keys.decryption_sk(),
        &policy.encrypted_payload_pk,
        &request.capsules[0],
        1,
        vec![verified],
        &ciphertext,
    )
    .expect("threshold of one");
    assert_eq!(plaintext, b"peace at dawn");
}

#[tokio::test]
async fn missing_version_header_is_rejected() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/reencrypt", net.workers[0].base_url))
        .body(Vec::new())
        .send()
        .await
        .expect("reachable");
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn outdated_version_is_rejected() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/reencrypt", net.workers[0].base_url))
        .header(&PROTOCOL_VERSION_HEADER, "0.1.0")
        .body(Vec::new())
        .send()
        .await
        .expect("reachable");
    assert_eq!(response.status().as_u16(), 400);
    let body: tpre_types::api::ErrorBody = response.json().await.expect("typed body");
    assert_eq!(body.code, error_codes::PROTOCOL_MISMATCH);
}

#[tokio::test]
async fn garbage_frame_is_bad_request() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/reencrypt", net.workers[0].base_url))
        .header(&PROTOCOL_VERSION_HEADER, "0.3.0")
        .body(b"not a frame".to_vec())
        .send()
        .await
        .expect("reachable");
    assert_eq!(response.status().as_u16(), 400);
    let body: tpre_types::api::ErrorBody = response.json().await.expect("typed body");
    assert_eq!(body.code, error_codes::BAD_REQUEST);
    assert!(!body.retriable);
}

#[tokio::test]
async fn foreign_signer_is_invalid_signature() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "foreign/signer").await;

    let (request, _) = reencryption_request(&policy, &retriever_keys, b"x", Vec::new());
    // signed by somebody who is not the request's retriever
    let imposter = tpre_test_utils::retriever_keys(b"imposter");
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, imposter.signer(), CALL_DEADLINE)
        .await
        .expect_err("signature must not verify");
    match err {
        TransportError::Rejected { code, .. } => assert_eq!(code, error_codes::INVALID_SIGNATURE),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_policy_handle_is_kfrag_not_held() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "not/held").await;

    let (mut request, _) = reencryption_request(&policy, &retriever_keys, b"x", Vec::new());
    request.hrac = Hrac::from_bytes([0x5a; 16]);
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("no fragment for this handle");
    match err {
        TransportError::Rejected { code, .. } => assert_eq!(code, error_codes::KFRAG_NOT_HELD),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn wrong_retriever_is_unknown_policy() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, _, policy) = one_of_one_grant(&net, "wrong/retriever").await;

    // a different retriever claiming the same policy handle
    let other = tpre_test_utils::retriever_keys(b"someone else");
    let (capsule, _) = tpre_core::encrypt(&policy.encrypted_payload_pk, b"x").expect("encrypts");
    let request = ReencryptionRequest {
        request_id: Uuid::new_v4(),
        hrac: policy.hrac,
        retriever_verifying_pk: other.verifying_pk().clone(),
        retriever_decryption_pk: other.decryption_pk().clone(),
        capsules: vec![capsule],
        conditions: Vec::new(),
    };
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, other.signer(), CALL_DEADLINE)
        .await
        .expect_err("policy binds a different retriever");
    match err {
        TransportError::Rejected { code, .. } => assert_eq!(code, error_codes::UNKNOWN_POLICY),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn denied_condition_rejects_the_whole_request() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "conditions").await;

    let (capsule_a, _) = tpre_core::encrypt(&policy.encrypted_payload_pk, b"a").expect("encrypts");
    let (capsule_b, _) = tpre_core::encrypt(&policy.encrypted_payload_pk, b"b").expect("encrypts");
    let request = ReencryptionRequest {
        request_id: Uuid::new_v4(),
        hrac: policy.hrac,
        retriever_verifying_pk: retriever_keys.verifying_pk().clone(),
        retriever_decryption_pk: retriever_keys.decryption_pk().clone(),
        capsules: vec![capsule_a, capsule_b],
        conditions: vec![None, Some(Condition::new("deny"))],
    };
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("one denied condition fails the batch");
    match err {
        TransportError::Rejected { code, .. } => assert_eq!(code, error_codes::CONDITION_NOT_MET),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn expired_policy_is_rejected() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, delegator) = setup::delegator(b"expiry");
    let (retriever_keys, _) = setup::retriever(b"expiry");
    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "short/lived",
            1,
            1,
            Timestamp::now().saturating_add(Duration::from_secs(2)),
        )
        .await
        .expect("grant succeeds while the window is open");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let (request, _) =
        reencryption_request(&outcome.policy, &retriever_keys, b"late", Vec::new());
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("window has passed");
    match err {
        TransportError::Rejected { code, .. } => assert_eq!(code, error_codes::POLICY_EXPIRED),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn replay_is_served_but_tampering_breaks_the_signature() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "replay").await;

    let (request, ciphertext) = reencryption_request(
        &policy,
        &retriever_keys,
        b"same thing twice",
        vec![Some(Condition::new("tuesday"))],
    );
    let frame = Envelope::seal_signed(
        MessageKind::ReencryptionRequest,
        &request,
        retriever_keys.signer(),
    )
    .encode();

    let http = reqwest::Client::new();
    let mut plaintexts = Vec::new();
    for _ in 0..2 {
        let response = http
            .post(format!("{}/api/v1/reencrypt", worker.base_url))
            .header(&PROTOCOL_VERSION_HEADER, "0.3.0")
            .body(frame.clone())
            .send()
            .await
            .expect("reachable");
        assert!(response.status().is_success(), "replay must be served");
        let bytes = response.bytes().await.expect("body");
        let envelope = Envelope::decode(&bytes).expect("well-formed reply");
        let reply: tpre_types::api::ReencryptionResponse = envelope
            .open_signed(MessageKind::ReencryptionResponse, &worker.metadata.verifying_pk)
            .expect("worker-signed reply");
        let verified = tpre_core::verify_cfrag(
            reply.cfrags[0].clone(),
            &request.capsules[0],
            &policy.delegator_verifying_pk,
            &policy.encrypted_payload_pk,
            &policy.retriever_decryption_pk,
        )
        .expect("replayed serve still verifies");
        let plaintext = tpre_core::decrypt_reencrypted(
            retriever_keys.decryption_sk(),
            &policy.encrypted_payload_pk,
            &request.capsules[0],
            1,
            vec![verified],
            &ciphertext,
        )
        .expect("decrypts");
        plaintexts.push(plaintext);
    }
    assert_eq!(plaintexts[0], plaintexts[1]);

    // flip one byte inside the condition text: the frame still parses but
    // the signature no longer covers what arrives
    let mut tampered = frame.clone();
    let position = tampered
        .windows(7)
        .position(|window| window == b"tuesday")
        .expect("condition text is embedded in the frame");
    tampered[position] = b'T';
    let response = http
        .post(format!("{}/api/v1/reencrypt", worker.base_url))
        .header(&PROTOCOL_VERSION_HEADER, "0.3.0")
        .body(tampered)
        .send()
        .await
        .expect("reachable");
    assert_eq!(response.status().as_u16(), 401);
    let body: tpre_types::api::ErrorBody = response.json().await.expect("typed body");
    assert_eq!(body.code, error_codes::INVALID_SIGNATURE);
}

#[tokio::test]
async fn overload_returns_typed_retry_later() {
    let oracle = Arc::new(TestOracle::new());
    let evaluator: tpre_types::api::ConditionEvaluatorService = Arc::new(TextConditionEvaluator);
    let mut options = TestWorkerOptions::new(0, oracle.clone(), evaluator);
    options.max_inflight = 0;
    let worker = TestWorker::start_with(options).await.expect("spawns");
    oracle.authorize(&worker.metadata);
    let fleet = learned_fleet(vec![worker.metadata.clone()], oracle.as_ref(), true).await;

    let (_, delegator) = setup::delegator(b"overload");
    let (retriever_keys, _) = setup::retriever(b"overload");
    let outcome = delegator
        .grant(
            &fleet,
            retriever_keys.decryption_pk(),
            "overload",
            1,
            1,
            Timestamp::now().saturating_add(Duration::from_secs(3600)),
        )
        .await
        .expect("enactment has no inflight bound");

    let (request, _) = reencryption_request(&outcome.policy, &retriever_keys, b"x", Vec::new());
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("no capacity");
    match err {
        TransportError::Rejected {
            code, retriable, ..
        } => {
            assert_eq!(code, error_codes::RETRY_LATER);
            assert!(retriable, "clients must be told to back off and retry");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn per_policy_rate_limit_kicks_in() {
    let oracle = Arc::new(TestOracle::new());
    let evaluator: tpre_types::api::ConditionEvaluatorService = Arc::new(TextConditionEvaluator);
    let mut options = TestWorkerOptions::new(0, oracle.clone(), evaluator);
    options.policy_rate_limit = 2;
    let worker = TestWorker::start_with(options).await.expect("spawns");
    oracle.authorize(&worker.metadata);
    let fleet = learned_fleet(vec![worker.metadata.clone()], oracle.as_ref(), true).await;

    let (_, delegator) = setup::delegator(b"ratelimit");
    let (retriever_keys, _) = setup::retriever(b"ratelimit");
    let outcome = delegator
        .grant(
            &fleet,
            retriever_keys.decryption_pk(),
            "ratelimit",
            1,
            1,
            Timestamp::now().saturating_add(Duration::from_secs(3600)),
        )
        .await
        .expect("grant succeeds");

    let client = WorkerApiClient::new();
    for _ in 0..2 {
        let (request, _) =
            reencryption_request(&outcome.policy, &retriever_keys, b"ok", Vec::new());
        client
            .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
            .await
            .expect("within budget");
    }
    let (request, _) = reencryption_request(&outcome.policy, &retriever_keys, b"x", Vec::new());
    let err = client
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("budget exhausted");
    match err {
        TransportError::Rejected {
            code, retriable, ..
        } => {
            assert_eq!(code, error_codes::RATE_LIMITED);
            assert!(retriable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_oracle_snapshot_rejects_reencryption() {
    let oracle = Arc::new(TestOracle::new());
    oracle.set_available(false);
    let evaluator: tpre_types::api::ConditionEvaluatorService = Arc::new(TextConditionEvaluator);
    let worker = TestWorker::start(0, oracle.clone(), evaluator)
        .await
        .expect("spawns degraded");
    oracle.authorize(&worker.metadata);
    // the client learned about the worker while the oracle was unreachable
    let fleet = learned_fleet(vec![worker.metadata.clone()], oracle.as_ref(), false).await;

    let (_, delegator) = setup::delegator(b"no-oracle");
    let (retriever_keys, _) = setup::retriever(b"no-oracle");
    let outcome = delegator
        .grant(
            &fleet,
            retriever_keys.decryption_pk(),
            "no-oracle",
            1,
            1,
            Timestamp::now().saturating_add(Duration::from_secs(3600)),
        )
        .await
        .expect("enactment does not consult the oracle");
    assert!(outcome.possibly_stale, "grant must carry the stale annotation");

    let (request, _) = reencryption_request(&outcome.policy, &retriever_keys, b"x", Vec::new());
    let err = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("no snapshot was ever taken");
    match err {
        TransportError::Rejected {
            code, retriable, ..
        } => {
            assert_eq!(code, error_codes::TEMPORARILY_UNAVAILABLE);
            assert!(retriable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn degraded_oracle_still_serves_from_recent_snapshot() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (_, retriever_keys, policy) = one_of_one_grant(&net, "degraded").await;

    // the chain endpoint goes away after the worker took its snapshot
    net.oracle.set_available(false);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (request, ciphertext) =
        reencryption_request(&policy, &retriever_keys, b"still on", Vec::new());
    let response = WorkerApiClient::new()
        .reencrypt(&worker.metadata, &request, retriever_keys.signer(), CALL_DEADLINE)
        .await
        .expect("recent snapshot keeps the worker serving");

    let verified = tpre_core::verify_cfrag(
        response.cfrags[0].clone(),
        &request.capsules[0],
        &policy.delegator_verifying_pk,
        &policy.encrypted_payload_pk,
        &policy.retriever_decryption_pk,
    )
    .expect("proof verifies");
    let plaintext = tpre_core::decrypt_reencrypted(
        retriever_keys.decryption_sk(),
        &policy.encrypted_payload_pk,
        &request.capsules[0],
        1,
        vec![verified],
        &ciphertext,
    )
    .expect("decrypts");
    assert_eq!(plaintext, b"still on");
}

#[tokio::test]
async fn enactment_is_idempotent_but_conflicts_are_rejected() {
    let net = TestNet::spawn(1).await.expect("net spawns");
    let worker = &net.workers[0];
    let (delegator_keys, retriever_keys, policy) = one_of_one_grant(&net, "enact/twice").await;

    // a second fragment for the same policy (fresh randomness, different
    // sealed bytes)
    let (payload_sk, _) = delegator_keys.derive_payload_keys(policy.label.as_bytes());
    let kfrags = tpre_core::generate_kfrags(
        &payload_sk,
        retriever_keys.decryption_pk(),
        delegator_keys.signer(),
        1,
        1,
        true,
        true,
    )
    .expect("valid threshold");
    let sealed = EncryptedKeyFrag::seal(&worker.metadata.decryption_pk, &kfrags[0]).expect("seals");
    let conflicting = EnactmentRequest {
        request_id: Uuid::new_v4(),
        policy: policy.clone(),
        encrypted_kfrag: sealed,
    };
    let err = WorkerApiClient::new()
        .enact(&worker.metadata, &conflicting, delegator_keys.signer(), CALL_DEADLINE)
        .await
        .expect_err("a different fragment for a held policy is a conflict");
    match err {
        TransportError::Rejected { code, .. } => {
            assert_eq!(code, error_codes::ENACTMENT_CONFLICT)
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
