//! End-to-end grant/retrieve scenarios across small worker fleets.


use std::time::Duration;

use setup::TestNet;
use tpre_client::{GrantError, RetrieveError, WorkerOutcomeKind};
use tpre_test_utils::{RogueWorker, learned_fleet};
use tpre_types::Timestamp;
use tpre_types::api::Condition;

fn expires_in(secs: u64) -> Timestamp {
    Timestamp::now().saturating_add(Duration::from_secs(secs))
}

/// Encrypts one payload under the policy's payload key.
fn encrypt_payload(
    policy: &tpre_types::policy::Policy,
    plaintext: &[u8],
) -> (umbral_pre::Capsule, Vec<u8>) {
    tpre_core::encrypt(&policy.encrypted_payload_pk, plaintext).expect("encrypts")
}

#[tokio::test]
async fn happy_path_three_of_five() {
    let net = TestNet::spawn(5).await.expect("net spawns");
    let (_, delegator) = setup::delegator(b"happy");
    let (retriever_keys, retriever) = setup::retriever(b"happy");

    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "happy/path",
            3,
            5,
            expires_in(3600),
        )
        .await
        .expect("all five enact");
    assert_eq!(outcome.policy.shares, 5);
    assert_eq!(outcome.receipts.len(), 5);
    assert!(outcome.failures.is_empty());
    assert!(!outcome.possibly_stale);

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"hello");
    let result = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[],
        )
        .await
        .expect("threshold met");
    assert_eq!(result.plaintexts, vec![b"hello".to_vec()]);

    // exactly three workers win, the two slowest are cancelled
    assert_eq!(result.report.served().len(), 3);
    let cancelled = result
        .report
        .outcomes
        .iter()
        .filter(|outcome| outcome.kind == WorkerOutcomeKind::Cancelled)
        .count();
    assert_eq!(cancelled, 2);
}

#[tokio::test]
async fn one_of_one_and_n_of_n_boundaries() {
    for (m, n) in [(1u16, 1u16), (4, 4)] {
        let net = TestNet::spawn(n as u8).await.expect("net spawns");
        let (_, delegator) = setup::delegator(b"bounds");
        let (retriever_keys, retriever) = setup::retriever(b"bounds");

        let outcome = delegator
            .grant(
                &net.fleet,
                retriever_keys.decryption_pk(),
                "bounds",
                m,
                n,
                expires_in(3600),
            )
            .await
            .expect("grant succeeds");

        let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"boundary");
        let result = retriever
            .retrieve(
                &net.fleet,
                &outcome.policy,
                &outcome.treasure_map,
                &[capsule],
                &[ciphertext],
                &[],
            )
            .await
            .expect("threshold met");
        assert_eq!(result.plaintexts, vec![b"boundary".to_vec()]);
        assert_eq!(result.report.served().len(), usize::from(m));
    }
}

#[tokio::test]
async fn invalid_cfrags_mark_workers_suspicious_but_threshold_still_wins() {
    // three honest workers and two rogues; the rogues answer with properly
    // signed envelopes whose fragments fail proof verification
    let mut net = TestNet::spawn(3).await.expect("net spawns");
    let rogue_a = RogueWorker::start(0).await.expect("rogue spawns");
    let rogue_b = RogueWorker::start(1).await.expect("rogue spawns");
    net.oracle.authorize(&rogue_a.metadata);
    net.oracle.authorize(&rogue_b.metadata);
    net.relearn(vec![rogue_a.metadata.clone(), rogue_b.metadata.clone()], true)
        .await;

    let (_, delegator) = setup::delegator(b"rogues");
    let (retriever_keys, retriever) = setup::retriever(b"rogues");
    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "rogues",
            3,
            5,
            expires_in(3600),
        )
        .await
        .expect("rogues acknowledge enactment, grant succeeds");

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"survives rogues");
    let result = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[],
        )
        .await
        .expect("three honest workers reach the threshold");
    assert_eq!(result.plaintexts, vec![b"survives rogues".to_vec()]);

    // all three honest workers served; a rogue can never end up among the
    // winners, only in the suspicious set (or cancelled if it lost the race)
    let rogue_ids = [rogue_a.metadata.node_id, rogue_b.metadata.node_id];
    let served = result.report.served();
    assert_eq!(served.len(), 3);
    assert!(served.iter().all(|node_id| !rogue_ids.contains(node_id)));
    let suspicious = result.report.suspicious();
    assert!(suspicious.iter().all(|node_id| rogue_ids.contains(node_id)));
    for rogue_id in rogue_ids {
        let outcome = result
            .report
            .outcomes
            .iter()
            .find(|outcome| outcome.node_id == rogue_id)
            .expect("every contacted worker is reported");
        assert!(matches!(
            outcome.kind,
            WorkerOutcomeKind::InvalidCfrags(_) | WorkerOutcomeKind::Cancelled
        ));
    }

    rogue_a.shutdown();
    rogue_b.shutdown();
}

#[tokio::test]
async fn below_threshold_reports_every_worker() {
    let net = TestNet::spawn(5).await.expect("net spawns");
    let (_, delegator) = setup::delegator(b"below");
    let (retriever_keys, retriever) = setup::retriever(b"below");

    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "below",
            3,
            5,
            expires_in(3600),
        )
        .await
        .expect("grant succeeds");

    // three of the five map workers go dark after enactment
    let map_workers: Vec<_> = outcome
        .treasure_map
        .open_destinations(retriever_keys.decryption_sk())
        .expect("retriever opens the map")
        .into_keys()
        .collect();
    let mut killed = 0;
    for worker in &net.workers {
        if killed == 3 {
            break;
        }
        if map_workers.contains(&worker.metadata.node_id) {
            worker.shutdown();
            killed += 1;
        }
    }
    assert_eq!(killed, 3);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"unreachable quorum");
    let err = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[],
        )
        .await
        .expect_err("two verified responses cannot meet three");
    let RetrieveError::ThresholdNotMet {
        verified,
        needed,
        report,
    } = err
    else {
        panic!("unexpected error kind");
    };
    assert_eq!(verified, 2);
    assert_eq!(needed, 3);
    assert_eq!(report.served().len(), 2);
    let unreachable = report
        .outcomes
        .iter()
        .filter(|outcome| matches!(outcome.kind, WorkerOutcomeKind::Unreachable(_)))
        .count();
    assert_eq!(unreachable, 3);
    assert!(report.retry_sensible());
}

#[tokio::test]
async fn stale_oracle_grant_is_annotated_and_still_works() {
    let net = TestNet::spawn(3).await.expect("net spawns");
    // the client learned the fleet while the oracle was unreachable
    net.oracle.set_available(false);
    let stale_fleet = learned_fleet(
        net.workers
            .iter()
            .map(|worker| worker.metadata.clone())
            .collect(),
        net.oracle.as_ref(),
        false,
    )
    .await;

    let (_, delegator) = setup::delegator(b"stale");
    let (retriever_keys, retriever) = setup::retriever(b"stale");
    let outcome = delegator
        .grant(
            &stale_fleet,
            retriever_keys.decryption_pk(),
            "stale",
            2,
            3,
            expires_in(3600),
        )
        .await
        .expect("grant proceeds on the last good view");
    assert!(outcome.possibly_stale);

    // the workers themselves still hold a recent snapshot, so retrieval
    // goes through
    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"stale but fine");
    let result = retriever
        .retrieve(
            &stale_fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[],
        )
        .await
        .expect("threshold met");
    assert_eq!(result.plaintexts, vec![b"stale but fine".to_vec()]);
}

#[tokio::test]
async fn quarantined_worker_fails_over_to_the_rest() {
    let net = TestNet::spawn(4).await.expect("net spawns");
    let (_, delegator) = setup::delegator(b"rotation");
    let (retriever_keys, retriever) = setup::retriever(b"rotation");

    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "rotation",
            2,
            3,
            expires_in(3600),
        )
        .await
        .expect("grant succeeds");
    let map_workers: Vec<_> = outcome
        .treasure_map
        .open_destinations(retriever_keys.decryption_sk())
        .expect("retriever opens the map")
        .into_keys()
        .collect();

    // one of the map's workers presents a rotated signing key for its
    // operator: the fleet quarantines both identities
    let victim = net
        .workers
        .iter()
        .find(|worker| map_workers.contains(&worker.metadata.node_id))
        .expect("map references spawned workers");
    let rotated_keys = tpre_core::keys::WorkerKeys::from_seed(b"rotated identity");
    let now = Timestamp::now();
    let rotated = tpre_types::crypto::NodeMetadataPayload {
        decryption_pk: rotated_keys.decryption_pk().clone(),
        network_address: victim.metadata.network_address.clone(),
        operator_address: victim.metadata.operator_address,
        domain: tpre_test_utils::test_domain(),
        protocol_version: "0.3.0".to_owned(),
        host_certificate: None,
        valid_from: now,
        expires_at: now.saturating_add(Duration::from_secs(3600)),
    }
    .sign(rotated_keys.signer());

    let snapshot = net.fleet.snapshot();
    let oracle_snapshot = {
        use tpre_types::chain::AuthorizationOracle as _;
        net.oracle
            .snapshot(&tpre_test_utils::test_domain())
            .await
            .expect("oracle reachable")
    };
    let (next, summary) = snapshot.merge(
        vec![(rotated, now)],
        &[],
        Some(&oracle_snapshot),
        true,
        &tpre_fleet::state::LivenessPolicy::default(),
        now,
        None,
    );
    assert_eq!(summary.quarantined, 2);
    net.fleet.install(next);
    assert!(net.fleet.snapshot().is_quarantined(&victim.metadata.node_id));

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"failover");
    let result = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[],
        )
        .await
        .expect("the two remaining map workers meet the threshold");
    assert_eq!(result.plaintexts, vec![b"failover".to_vec()]);
    assert!(
        result
            .report
            .outcomes
            .iter()
            .any(|o| o.kind == WorkerOutcomeKind::Quarantined && o.node_id == victim.metadata.node_id)
    );
}

#[tokio::test]
async fn grant_replaces_failed_workers_and_reports_them() {
    let net = TestNet::spawn(5).await.expect("net spawns");
    // two workers die before the grant
    net.workers[0].shutdown();
    net.workers[1].shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, delegator) = setup::impatient_delegator(b"partial");
    let (retriever_keys, _) = setup::retriever(b"partial");
    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "partial",
            2,
            4,
            expires_in(3600),
        )
        .await
        .expect("three live workers beat the threshold of two");

    // four were requested, three live workers could enact
    assert_eq!(outcome.policy.shares, 3);
    assert_eq!(outcome.receipts.len(), 3);
    assert_eq!(outcome.failures.len(), 2);
    assert!(
        outcome
            .failures
            .iter()
            .all(|failure| matches!(failure.kind, WorkerOutcomeKind::Unreachable(_)))
    );
}

#[tokio::test]
async fn grant_fails_below_threshold_with_a_report() {
    let net = TestNet::spawn(4).await.expect("net spawns");
    for worker in &net.workers[..3] {
        worker.shutdown();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, delegator) = setup::impatient_delegator(b"grant-fail");
    let (retriever_keys, _) = setup::retriever(b"grant-fail");
    let err = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "grant-fail",
            3,
            4,
            expires_in(3600),
        )
        .await
        .expect_err("one live worker cannot meet a threshold of three");
    let GrantError::ThresholdNotEnacted {
        enacted,
        threshold,
        failures,
    } = err
    else {
        panic!("unexpected error kind");
    };
    assert_eq!(enacted, 1);
    assert_eq!(threshold, 3);
    assert_eq!(failures.len(), 3);
}

#[tokio::test]
async fn conditions_travel_with_the_retrieval() {
    let net = TestNet::spawn(3).await.expect("net spawns");
    let (_, delegator) = setup::delegator(b"conditional");
    let (retriever_keys, retriever) = setup::retriever(b"conditional");

    let outcome = delegator
        .grant(
            &net.fleet,
            retriever_keys.decryption_pk(),
            "conditional",
            2,
            3,
            expires_in(3600),
        )
        .await
        .expect("grant succeeds");

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"allowed");
    let result = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[Some(Condition::new("time>=2024"))],
        )
        .await
        .expect("condition passes at every worker");
    assert_eq!(result.plaintexts, vec![b"allowed".to_vec()]);

    let (capsule, ciphertext) = encrypt_payload(&outcome.policy, b"denied");
    let err = retriever
        .retrieve(
            &net.fleet,
            &outcome.policy,
            &outcome.treasure_map,
            &[capsule],
            &[ciphertext],
            &[Some(Condition::new("deny"))],
        )
        .await
        .expect_err("every worker denies the condition");
    let RetrieveError::ThresholdNotMet { report, .. } = err else {
        panic!("unexpected error kind");
    };
    assert!(
        report
            .outcomes
            .iter()
            .all(|outcome| matches!(&outcome.kind, WorkerOutcomeKind::Rejected { code, .. }
                if code == tpre_types::api::error_codes::CONDITION_NOT_MET))
    );
}
