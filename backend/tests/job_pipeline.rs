//! End-to-end pipeline tests over the in-memory test doubles.
//!
//! These suites drive whole submit/execute/retry flows through the real
//! services, asserting the durable rows, ledger balances, and stored files
//! that remain after each scenario.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backend::JobPipelineConfig;
use backend::domain::ports::{
    GatewayImage, GatewayPayload, ProviderGateway, ProviderGatewayError, QueuedJob,
};
use backend::domain::{
    ClientId, CreationJobPorts, CreationJobService, CreationStatus, JobFailureKind, JobRunOutcome,
    LandscapeJobService, LandscapeState, JobOutcome, ProviderId, Requester, SubmitCreationRequest,
    SubmitLandscapeRequest, SubmitTrialRequest, TrialPoolPorts, TrialPoolService, TrialSubmission,
    UserId,
};
use backend::test_support::job_pipeline::{
    InMemoryCreationRepository, InMemoryCreditLedger, InMemoryProviderRepository,
    InMemoryTrialRepository, MutableClock, RecordingJobQueue, RecordingStorageSink,
    ScriptedProviderGateway, test_provider,
};
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use rstest::{fixture, rstest};
use serde_json::{Map, Value};
use tokio::sync::Barrier;
use url::Url;

struct Pipeline {
    clock: Arc<MutableClock>,
    ledger: Arc<InMemoryCreditLedger>,
    creations: Arc<InMemoryCreationRepository>,
    trials: Arc<InMemoryTrialRepository>,
    storage: Arc<RecordingStorageSink>,
    gateway: Arc<ScriptedProviderGateway>,
    queue: Arc<RecordingJobQueue>,
    provider_owner: UserId,
    creation_jobs: CreationJobService,
    landscape_jobs: LandscapeJobService,
    trial_pool: TrialPoolService,
}

#[fixture]
fn pipeline() -> Pipeline {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();

    let clock = Arc::new(MutableClock::new(
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).single().expect("valid timestamp"),
    ));
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let creations = Arc::new(InMemoryCreationRepository::new());
    let trials = Arc::new(InMemoryTrialRepository::new());
    let providers = Arc::new(InMemoryProviderRepository::new());
    let storage = Arc::new(RecordingStorageSink::new());
    let gateway = Arc::new(ScriptedProviderGateway::new());
    let queue = Arc::new(RecordingJobQueue::new());

    let provider_owner = UserId::random();
    providers.seed(test_provider(7, &provider_owner));

    let creation_ports = CreationJobPorts {
        providers: providers.clone(),
        creations: creations.clone(),
        ledger: ledger.clone(),
        gateway: gateway.clone(),
        normalizer: Arc::new(backend::domain::ports::FixtureImageNormalizer),
        storage: storage.clone(),
        queue: queue.clone(),
        tokens: Arc::new(backend::domain::ports::FixtureAccessTokenMinter),
    };
    let trial_ports = TrialPoolPorts {
        trials: trials.clone(),
        providers: providers.clone(),
        gateway: gateway.clone(),
        normalizer: Arc::new(backend::domain::ports::FixtureImageNormalizer),
        storage: storage.clone(),
        queue: queue.clone(),
    };
    let config = JobPipelineConfig::default();

    Pipeline {
        creation_jobs: CreationJobService::new(
            creation_ports.clone(),
            config.clone(),
            clock.clone(),
        ),
        landscape_jobs: LandscapeJobService::new(creation_ports, config.clone(), clock.clone()),
        trial_pool: TrialPoolService::new(trial_ports, config, clock.clone()),
        clock,
        ledger,
        creations,
        trials,
        storage,
        gateway,
        queue,
        provider_owner,
    }
}

fn creation_request(owner: &UserId, credit_cost: i64) -> SubmitCreationRequest {
    SubmitCreationRequest {
        requester: Requester::user(owner.clone()),
        provider_id: ProviderId::new(7),
        method: "generate".to_owned(),
        args: Map::new(),
        credit_cost,
        mutate_of_id: None,
    }
}

/// Gateway that holds every call at a barrier before failing it, letting two
/// deliveries of one job both pass the status gate before either reconciles.
struct HeldFailingGateway {
    barrier: Barrier,
}

#[async_trait]
impl ProviderGateway for HeldFailingGateway {
    async fn invoke(
        &self,
        _endpoint: &Url,
        _auth_token: &str,
        _payload: &GatewayPayload,
        _timeout: Duration,
    ) -> Result<GatewayImage, ProviderGatewayError> {
        self.barrier.wait().await;
        Err(ProviderGatewayError::status(500, "upstream exploded"))
    }
}

fn trial_request(client: &str) -> SubmitTrialRequest {
    SubmitTrialRequest {
        client_id: ClientId::new(client).expect("non-empty client id"),
        prompt: "a quiet harbour".to_owned(),
        provider_id: ProviderId::new(7),
        method: "generate".to_owned(),
        args: Map::new(),
    }
}

#[rstest]
#[tokio::test]
async fn a_paid_creation_completes_and_shares_revenue(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 15);

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 10))
        .await
        .expect("submit succeeds");
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);
    assert!(creation.filename.starts_with("pending/"));

    let jobs = pipeline.queue.drain();
    assert_eq!(
        jobs,
        vec![QueuedJob::Creation {
            creation_id: creation.id
        }]
    );

    let outcome = pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("execute succeeds");
    assert_eq!(outcome, JobRunOutcome::Completed);

    let row = pipeline.creations.get(creation.id).expect("row exists");
    assert_eq!(row.status, CreationStatus::Completed);
    assert!(row.filename.starts_with("creations/"));
    assert_eq!(
        row.url.as_deref(),
        Some(format!("https://storage.invalid/{}", row.filename).as_str())
    );
    assert!(matches!(
        row.metadata.outcome,
        JobOutcome::Completed { width: 1024, .. }
    ));
    // 30% of the 10-credit cost goes to the provider owner.
    assert_eq!(pipeline.ledger.balance_of(&pipeline.provider_owner), 3);
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);
}

#[rstest]
#[tokio::test]
async fn a_provider_error_fails_the_row_and_refunds_exactly_once(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 5);
    pipeline.gateway.push(Err(ProviderGatewayError::status(
        500,
        "upstream exploded with a very detailed message",
    )));

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    assert_eq!(pipeline.ledger.balance_of(&owner), 3);

    let outcome = pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("execute reconciles");
    assert_eq!(outcome, JobRunOutcome::Failed(JobFailureKind::ProviderError));

    let row = pipeline.creations.get(creation.id).expect("row exists");
    assert_eq!(row.status, CreationStatus::Failed);
    let JobOutcome::Failed {
        failure,
        credits_refunded,
        ..
    } = &row.metadata.outcome
    else {
        panic!("expected a failed outcome, got {:?}", row.metadata.outcome);
    };
    assert!(credits_refunded);
    assert_eq!(failure.kind, JobFailureKind::ProviderError);
    assert_eq!(
        failure.provider_error.as_deref(),
        Some("upstream exploded with a very detailed message")
    );
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);

    // A duplicate delivery after the failure neither rewrites nor refunds.
    let duplicate = pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("duplicate delivery is safe");
    assert_eq!(duplicate, JobRunOutcome::AlreadyHandled);
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);
    assert_eq!(pipeline.gateway.invocation_count(), 1);
}

#[rstest]
#[tokio::test]
async fn concurrent_duplicate_deliveries_refund_a_failed_attempt_once() {
    let clock = Arc::new(MutableClock::new(
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0)
            .single()
            .expect("valid timestamp"),
    ));
    let ledger = Arc::new(InMemoryCreditLedger::new());
    let creations = Arc::new(InMemoryCreationRepository::new());
    let providers = Arc::new(InMemoryProviderRepository::new());
    let provider_owner = UserId::random();
    providers.seed(test_provider(7, &provider_owner));

    let creation_jobs = CreationJobService::new(
        CreationJobPorts {
            providers,
            creations: creations.clone(),
            ledger: ledger.clone(),
            gateway: Arc::new(HeldFailingGateway {
                barrier: Barrier::new(2),
            }),
            normalizer: Arc::new(backend::domain::ports::FixtureImageNormalizer),
            storage: Arc::new(RecordingStorageSink::new()),
            queue: Arc::new(RecordingJobQueue::new()),
            tokens: Arc::new(backend::domain::ports::FixtureAccessTokenMinter),
        },
        JobPipelineConfig::default(),
        clock,
    );

    let owner = UserId::random();
    ledger.set_balance(&owner, 13);
    let creation = creation_jobs
        .submit(creation_request(&owner, 3))
        .await
        .expect("submit succeeds");
    assert_eq!(ledger.balance_of(&owner), 10);

    // Both deliveries pass the status gate before the barrier releases them
    // into the same failure.
    let (first, second) = tokio::join!(
        creation_jobs.execute(creation.id),
        creation_jobs.execute(creation.id)
    );
    let outcomes = [
        first.expect("first delivery reconciles"),
        second.expect("second delivery reconciles"),
    ];

    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, JobRunOutcome::Failed(_)))
            .count(),
        1,
        "exactly one delivery settles the row"
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == JobRunOutcome::AlreadyHandled)
            .count(),
        1,
        "the losing delivery is a no-op"
    );

    let row = creations.get(creation.id).expect("row exists");
    assert_eq!(row.status, CreationStatus::Failed);
    assert!(matches!(
        row.metadata.outcome,
        JobOutcome::Failed {
            credits_refunded: true,
            ..
        }
    ));
    assert_eq!(
        ledger.balance_of(&owner),
        13,
        "a single failed attempt must be refunded exactly once"
    );
}

#[rstest]
#[tokio::test]
async fn a_gateway_timeout_is_classified_as_timeout(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 5);
    pipeline
        .gateway
        .push(Err(ProviderGatewayError::timeout("deadline exceeded")));

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    let outcome = pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("execute reconciles");

    assert_eq!(outcome, JobRunOutcome::Failed(JobFailureKind::Timeout));
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);
}

#[rstest]
#[tokio::test]
async fn retrying_a_failed_row_keeps_the_accounting_balanced(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 5);
    pipeline
        .gateway
        .push(Err(ProviderGatewayError::transport("connection reset")));

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("execute reconciles");
    // Failure refunded: 5 - 2 + 2.
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);

    let retried = pipeline
        .creation_jobs
        .retry_in_place(creation.id, &Requester::user(owner.clone()))
        .await
        .expect("retry succeeds");
    assert_eq!(retried.id, creation.id);
    assert_eq!(retried.status, CreationStatus::Creating);
    assert_eq!(pipeline.ledger.balance_of(&owner), 3);

    pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("second execute succeeds");
    let row = pipeline.creations.get(creation.id).expect("row exists");
    assert_eq!(row.status, CreationStatus::Completed);
    assert_eq!(pipeline.ledger.balance_of(&owner), 3);
}

#[rstest]
#[tokio::test]
async fn an_abandoned_row_can_be_retried_after_its_deadline(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 5);

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    assert_eq!(pipeline.ledger.balance_of(&owner), 3);

    // Still inside the 60 second submission budget.
    let requester = Requester::user(owner.clone());
    let early = pipeline
        .creation_jobs
        .retry_in_place(creation.id, &requester)
        .await;
    assert!(early.is_err());

    pipeline.clock.advance_seconds(61);
    let retried = pipeline
        .creation_jobs
        .retry_in_place(creation.id, &requester)
        .await
        .expect("retry succeeds past the deadline");

    assert_eq!(retried.status, CreationStatus::Creating);
    // Timeout refund then fresh debit: 3 + 2 - 2.
    assert_eq!(pipeline.ledger.balance_of(&owner), 3);
}

#[rstest]
#[tokio::test]
async fn mutation_lineage_survives_an_in_place_retry(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 10);

    let source = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("source submit succeeds");
    pipeline
        .creation_jobs
        .execute(source.id)
        .await
        .expect("source completes");

    let mut request = creation_request(&owner, 2);
    request.mutate_of_id = Some(source.id);
    let mutation = pipeline
        .creation_jobs
        .submit(request)
        .await
        .expect("mutation submit succeeds");
    let lineage = mutation.metadata.lineage.clone().expect("lineage recorded");
    assert_eq!(lineage.mutate_of_id, source.id);
    assert_eq!(lineage.history, vec![source.id]);

    pipeline
        .gateway
        .push(Err(ProviderGatewayError::transport("connection reset")));
    pipeline
        .creation_jobs
        .execute(mutation.id)
        .await
        .expect("mutation fails and reconciles");
    let retried = pipeline
        .creation_jobs
        .retry_in_place(mutation.id, &Requester::user(owner))
        .await
        .expect("retry succeeds");

    assert_eq!(
        retried.metadata.lineage.expect("lineage kept").history,
        vec![source.id]
    );
}

#[rstest]
#[tokio::test]
async fn trial_results_are_shared_across_clients_through_the_pool(pipeline: Pipeline) {
    let first = pipeline
        .trial_pool
        .submit(trial_request("client-a"))
        .await
        .expect("first submit succeeds");
    let TrialSubmission::Submitted { creation, request } = first else {
        panic!("expected a fresh submission, got {first:?}");
    };
    assert!(request.fulfilled_at.is_none());

    pipeline
        .trial_pool
        .execute(creation.id)
        .await
        .expect("trial completes");
    let fulfilled = pipeline
        .trials
        .get_request(request.id)
        .expect("request exists");
    assert!(fulfilled.fulfilled_at.is_some());

    // The generation call carries the prompt the result will be pooled under.
    let payloads = pipeline.gateway.invocations();
    assert_eq!(
        payloads[0].args.get("prompt"),
        Some(&Value::String("a quiet harbour".to_owned()))
    );

    let second = pipeline
        .trial_pool
        .submit(trial_request("client-b"))
        .await
        .expect("second submit succeeds");
    let TrialSubmission::CacheHit {
        creation: pooled,
        request: link,
    } = second
    else {
        panic!("expected a cache hit, got {second:?}");
    };
    assert_eq!(pooled.id, creation.id);
    assert!(link.fulfilled_at.is_some());
    // No second user-facing generation ran.
    assert_eq!(pipeline.gateway.invocation_count(), 1);

    // The hit topped the pool back up under the reserved identity.
    let refills = pipeline.trials.pool_creations();
    assert_eq!(refills.len(), 1);
    assert!(pipeline
        .queue
        .drain()
        .contains(&QueuedJob::Trial {
            trial_id: refills[0].id
        }));
}

#[rstest]
#[tokio::test]
async fn pool_picks_are_spread_across_entries(pipeline: Pipeline) {
    // Fill the pool with two distinct completed results.
    for client in ["seed-a", "seed-b"] {
        let submitted = pipeline
            .trial_pool
            .submit(trial_request(client))
            .await
            .expect("seed submit succeeds");
        match submitted {
            TrialSubmission::Submitted { creation, .. } => {
                pipeline
                    .trial_pool
                    .execute(creation.id)
                    .await
                    .expect("seed completes");
            }
            TrialSubmission::CacheHit { creation, .. } => {
                // The second seed may hit the first seed's pool entry; force
                // a distinct entry by completing the refill row instead.
                let _ = creation;
                for refill in pipeline.trials.pool_creations() {
                    pipeline
                        .trial_pool
                        .execute(refill.id)
                        .await
                        .expect("refill completes");
                }
            }
            TrialSubmission::Existing { .. } => panic!("seed clients are distinct"),
        }
    }

    let picks = join_all((0..100).map(|index| {
        let pool = &pipeline.trial_pool;
        let client = format!("picker-{index}");
        async move {
            match pool.submit(trial_request(&client)).await {
                Ok(TrialSubmission::CacheHit { creation, .. }) => creation.id,
                other => panic!("expected a cache hit, got {other:?}"),
            }
        }
    }))
    .await;

    let distinct: HashSet<_> = picks.into_iter().collect();
    assert!(
        distinct.len() >= 2,
        "100 uniform picks over a pool of at least two entries should hit more than one"
    );
}

#[rstest]
#[tokio::test]
async fn shared_trial_files_are_deleted_only_by_the_last_discard(pipeline: Pipeline) {
    let first = pipeline
        .trial_pool
        .submit(trial_request("client-a"))
        .await
        .expect("first submit succeeds");
    let TrialSubmission::Submitted {
        creation,
        request: request_a,
    } = first
    else {
        panic!("expected a fresh submission, got {first:?}");
    };
    pipeline
        .trial_pool
        .execute(creation.id)
        .await
        .expect("trial completes");

    let second = pipeline
        .trial_pool
        .submit(trial_request("client-b"))
        .await
        .expect("second submit succeeds");
    let TrialSubmission::CacheHit {
        request: request_b, ..
    } = second
    else {
        panic!("expected a cache hit, got {second:?}");
    };

    let stored = pipeline
        .trials
        .get_creation(creation.id)
        .expect("creation exists")
        .filename;

    pipeline
        .trial_pool
        .discard(&ClientId::new("client-a").expect("valid id"), request_a.id)
        .await
        .expect("first discard succeeds");
    assert!(pipeline.storage.deleted_keys().is_empty());

    pipeline
        .trial_pool
        .discard(&ClientId::new("client-b").expect("valid id"), request_b.id)
        .await
        .expect("second discard succeeds");
    assert_eq!(pipeline.storage.deleted_keys(), vec![stored]);
}

#[rstest]
#[tokio::test]
async fn landscapes_replace_their_predecessor_after_becoming_durable(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 10);

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("creation completes");

    let landscape_request = SubmitLandscapeRequest {
        requester: Requester::user(owner.clone()),
        creation_id: creation.id,
        provider_id: ProviderId::new(7),
        method: "widescreen".to_owned(),
        args: Map::new(),
        credit_cost: 2,
    };
    pipeline
        .landscape_jobs
        .submit(landscape_request.clone())
        .await
        .expect("landscape submit succeeds");
    assert_eq!(pipeline.ledger.balance_of(&owner), 6);

    pipeline
        .landscape_jobs
        .execute(creation.id)
        .await
        .expect("landscape completes");
    let row = pipeline.creations.get(creation.id).expect("row exists");
    let LandscapeState::Ready { filename: first, .. } = row.metadata.landscape.clone() else {
        panic!("expected a ready landscape, got {:?}", row.metadata.landscape);
    };
    assert!(pipeline.storage.deleted_keys().is_empty());

    // Regenerate: the first file goes away only after the second is durable.
    pipeline
        .landscape_jobs
        .submit(landscape_request)
        .await
        .expect("second landscape submit succeeds");
    pipeline
        .landscape_jobs
        .execute(creation.id)
        .await
        .expect("second landscape completes");

    let row = pipeline.creations.get(creation.id).expect("row exists");
    let LandscapeState::Ready { filename: second, .. } = row.metadata.landscape.clone() else {
        panic!("expected a ready landscape, got {:?}", row.metadata.landscape);
    };
    assert_ne!(first, second);
    assert_eq!(pipeline.storage.deleted_keys(), vec![first]);
}

#[rstest]
#[tokio::test]
async fn a_failed_landscape_refunds_without_touching_the_primary(pipeline: Pipeline) {
    let owner = UserId::random();
    pipeline.ledger.set_balance(&owner, 10);

    let creation = pipeline
        .creation_jobs
        .submit(creation_request(&owner, 2))
        .await
        .expect("submit succeeds");
    pipeline
        .creation_jobs
        .execute(creation.id)
        .await
        .expect("creation completes");

    pipeline.gateway.push(Err(ProviderGatewayError::status(
        503,
        "widescreen renderer offline",
    )));
    pipeline
        .landscape_jobs
        .submit(SubmitLandscapeRequest {
            requester: Requester::user(owner.clone()),
            creation_id: creation.id,
            provider_id: ProviderId::new(7),
            method: "widescreen".to_owned(),
            args: Map::new(),
            credit_cost: 3,
        })
        .await
        .expect("landscape submit succeeds");
    assert_eq!(pipeline.ledger.balance_of(&owner), 5);

    pipeline
        .landscape_jobs
        .execute(creation.id)
        .await
        .expect("landscape reconciles");

    let row = pipeline.creations.get(creation.id).expect("row exists");
    assert_eq!(row.status, CreationStatus::Completed);
    assert!(matches!(
        row.metadata.landscape,
        LandscapeState::Failed {
            credits_refunded: true,
            ..
        }
    ));
    assert_eq!(pipeline.ledger.balance_of(&owner), 8);
}
