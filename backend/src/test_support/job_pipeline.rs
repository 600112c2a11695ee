//! Shared test doubles for job pipeline tests.
//!
//! In-memory adapters with real semantics (state transitions, balance
//! flooring, reference counting) so integration tests can drive whole
//! submit/execute flows without infrastructure. Panicking on poisoned
//! mutexes is deliberate: a double that lost its state must fail the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;
use url::Url;

use crate::domain::creation::{
    CompletionUpdate, Creation, CreationMetadata, CreationStatus, JobOutcome, LandscapeState,
};
use crate::domain::identity::{ClientId, CreationId, ProviderId, TrialId, TrialRequestId, UserId};
use crate::domain::ports::{
    CreationRepository, CreationRepositoryError, CreditLedger, CreditLedgerError, GatewayImage,
    GatewayPayload, ImageAttributes, JobDispatchError, JobQueue, Provider, ProviderGateway,
    ProviderGatewayError, ProviderRepository, ProviderRepositoryError, ProviderStatus, QueuedJob,
    StorageSink, StorageSinkError, TrialRepository, TrialRepositoryError,
};
use crate::domain::trial::{NewTrialCreation, NewTrialRequest, TrialCreation, TrialRequest};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(_) => panic!("{what} mutex poisoned"),
    }
}

/// Clock whose reading tests can move forward.
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, delta: Duration) {
        let delta = match TimeDelta::from_std(delta) {
            Ok(delta) => delta,
            Err(error) => {
                panic!("failed to convert Duration to TimeDelta: {error}; delta={delta:?}")
            }
        };
        *lock(&self.0, "clock") += delta;
    }

    pub fn advance_seconds(&self, seconds: i64) {
        *lock(&self.0, "clock") += TimeDelta::seconds(seconds);
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *lock(&self.0, "clock")
    }
}

/// Creation rows held in a map, with real status transitions.
#[derive(Default)]
pub struct InMemoryCreationRepository {
    rows: Mutex<HashMap<CreationId, Creation>>,
    next_id: AtomicI64,
}

impl InMemoryCreationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read for assertions.
    pub fn get(&self, creation_id: CreationId) -> Option<Creation> {
        lock(&self.rows, "creation rows").get(&creation_id).cloned()
    }

    /// Seed a pre-existing row, keeping its id.
    pub fn seed(&self, creation: Creation) {
        lock(&self.rows, "creation rows").insert(creation.id, creation);
    }
}

#[async_trait]
impl CreationRepository for InMemoryCreationRepository {
    async fn insert(
        &self,
        draft: crate::domain::creation::NewCreation,
    ) -> Result<Creation, CreationRepositoryError> {
        let id = CreationId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let creation = Creation {
            id,
            owner: draft.owner,
            status: CreationStatus::Creating,
            credit_cost: draft.credit_cost,
            published: false,
            filename: draft.filename,
            url: None,
            metadata: draft.metadata,
        };
        lock(&self.rows, "creation rows").insert(id, creation.clone());
        Ok(creation)
    }

    async fn find_by_id(
        &self,
        creation_id: CreationId,
    ) -> Result<Option<Creation>, CreationRepositoryError> {
        Ok(lock(&self.rows, "creation rows").get(&creation_id).cloned())
    }

    async fn mark_completed(
        &self,
        creation_id: CreationId,
        update: CompletionUpdate,
    ) -> Result<bool, CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        if row.status != CreationStatus::Creating {
            return Ok(false);
        }
        row.status = CreationStatus::Completed;
        row.filename = update.filename;
        row.url = Some(update.url);
        row.metadata = update.metadata;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        creation_id: CreationId,
        metadata: CreationMetadata,
    ) -> Result<bool, CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        if row.status != CreationStatus::Creating {
            return Ok(false);
        }
        row.status = CreationStatus::Failed;
        row.metadata = metadata;
        Ok(true)
    }

    async fn claim_refund(
        &self,
        creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        if let JobOutcome::Failed {
            credits_refunded, ..
        } = &mut row.metadata.outcome
        {
            if !*credits_refunded {
                *credits_refunded = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reset_for_retry(
        &self,
        creation_id: CreationId,
        filename: String,
        credit_cost: i64,
        metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        row.status = CreationStatus::Creating;
        row.filename = filename;
        row.credit_cost = credit_cost;
        row.url = None;
        row.metadata = metadata;
        Ok(())
    }

    async fn update_metadata(
        &self,
        creation_id: CreationId,
        metadata: CreationMetadata,
    ) -> Result<(), CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        row.metadata = metadata;
        Ok(())
    }

    async fn settle_landscape(
        &self,
        creation_id: CreationId,
        state: LandscapeState,
    ) -> Result<bool, CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        if !row.metadata.landscape.is_loading() {
            return Ok(false);
        }
        row.metadata.landscape = state;
        Ok(true)
    }

    async fn claim_landscape_refund(
        &self,
        creation_id: CreationId,
    ) -> Result<bool, CreationRepositoryError> {
        let mut rows = lock(&self.rows, "creation rows");
        let row = rows
            .get_mut(&creation_id)
            .ok_or_else(|| CreationRepositoryError::query("row not found"))?;
        if let LandscapeState::Failed {
            credits_refunded, ..
        } = &mut row.metadata.landscape
        {
            if !*credits_refunded {
                *credits_refunded = true;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Trial creations and request links held in maps.
#[derive(Default)]
pub struct InMemoryTrialRepository {
    creations: Mutex<HashMap<TrialId, TrialCreation>>,
    requests: Mutex<HashMap<TrialRequestId, TrialRequest>>,
    next_creation_id: AtomicI64,
    next_request_id: AtomicI64,
}

impl InMemoryTrialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_creation(&self, trial_id: TrialId) -> Option<TrialCreation> {
        lock(&self.creations, "trial creations").get(&trial_id).cloned()
    }

    pub fn get_request(&self, request_id: TrialRequestId) -> Option<TrialRequest> {
        lock(&self.requests, "trial requests").get(&request_id).cloned()
    }

    /// Every creation owned by the reserved pool identity.
    pub fn pool_creations(&self) -> Vec<TrialCreation> {
        lock(&self.creations, "trial creations")
            .values()
            .filter(|creation| creation.client_id.is_pool())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TrialRepository for InMemoryTrialRepository {
    async fn insert_creation(
        &self,
        draft: NewTrialCreation,
    ) -> Result<TrialCreation, TrialRepositoryError> {
        let id = TrialId::new(self.next_creation_id.fetch_add(1, Ordering::SeqCst) + 1);
        let creation = TrialCreation {
            id,
            client_id: draft.client_id,
            prompt: draft.prompt,
            status: CreationStatus::Creating,
            filename: draft.filename,
            url: None,
            created_at: draft.created_at,
            metadata: draft.metadata,
        };
        lock(&self.creations, "trial creations").insert(id, creation.clone());
        Ok(creation)
    }

    async fn find_creation_by_id(
        &self,
        trial_id: TrialId,
    ) -> Result<Option<TrialCreation>, TrialRepositoryError> {
        Ok(lock(&self.creations, "trial creations").get(&trial_id).cloned())
    }

    async fn mark_creation_completed(
        &self,
        trial_id: TrialId,
        update: CompletionUpdate,
    ) -> Result<bool, TrialRepositoryError> {
        let mut creations = lock(&self.creations, "trial creations");
        let row = creations
            .get_mut(&trial_id)
            .ok_or_else(|| TrialRepositoryError::query("row not found"))?;
        if row.status != CreationStatus::Creating {
            return Ok(false);
        }
        row.status = CreationStatus::Completed;
        row.filename = update.filename;
        row.url = Some(update.url);
        row.metadata = update.metadata;
        Ok(true)
    }

    async fn mark_creation_failed(
        &self,
        trial_id: TrialId,
        metadata: CreationMetadata,
    ) -> Result<bool, TrialRepositoryError> {
        let mut creations = lock(&self.creations, "trial creations");
        let row = creations
            .get_mut(&trial_id)
            .ok_or_else(|| TrialRepositoryError::query("row not found"))?;
        if row.status != CreationStatus::Creating {
            return Ok(false);
        }
        row.status = CreationStatus::Failed;
        row.metadata = metadata;
        Ok(true)
    }

    async fn find_recent_completed_by_prompt(
        &self,
        prompt: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrialCreation>, TrialRepositoryError> {
        let mut matches: Vec<_> = lock(&self.creations, "trial creations")
            .values()
            .filter(|creation| {
                creation.status == CreationStatus::Completed
                    && creation.prompt == prompt
                    && creation.created_at >= since
            })
            .cloned()
            .collect();
        matches.sort_by_key(|creation| std::cmp::Reverse(creation.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn count_requests_by_filename(
        &self,
        filename: &str,
    ) -> Result<u64, TrialRepositoryError> {
        let creations = lock(&self.creations, "trial creations");
        let referencing: Vec<TrialId> = creations
            .values()
            .filter(|creation| creation.filename == filename)
            .map(|creation| creation.id)
            .collect();
        let count = lock(&self.requests, "trial requests")
            .values()
            .filter(|request| {
                request
                    .trial_id
                    .is_some_and(|trial_id| referencing.contains(&trial_id))
            })
            .count();
        Ok(count as u64)
    }

    async fn insert_request(
        &self,
        draft: NewTrialRequest,
    ) -> Result<TrialRequest, TrialRepositoryError> {
        let id = TrialRequestId::new(self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1);
        let request = TrialRequest {
            id,
            client_id: draft.client_id,
            prompt: draft.prompt,
            trial_id: Some(draft.trial_id),
            created_at: draft.created_at,
            fulfilled_at: draft.fulfilled_at,
        };
        lock(&self.requests, "trial requests").insert(id, request.clone());
        Ok(request)
    }

    async fn find_request_by_id(
        &self,
        request_id: TrialRequestId,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError> {
        Ok(lock(&self.requests, "trial requests").get(&request_id).cloned())
    }

    async fn find_request_by_client_and_prompt(
        &self,
        client_id: &ClientId,
        prompt: &str,
    ) -> Result<Option<TrialRequest>, TrialRepositoryError> {
        let requests = lock(&self.requests, "trial requests");
        let mut matches: Vec<_> = requests
            .values()
            .filter(|request| &request.client_id == client_id && request.prompt == prompt)
            .cloned()
            .collect();
        matches.sort_by_key(|request| std::cmp::Reverse(request.created_at));
        Ok(matches.into_iter().next())
    }

    async fn fulfil_requests_for_creation(
        &self,
        trial_id: TrialId,
        fulfilled_at: DateTime<Utc>,
    ) -> Result<(), TrialRepositoryError> {
        let mut requests = lock(&self.requests, "trial requests");
        for request in requests.values_mut() {
            if request.trial_id == Some(trial_id) && request.fulfilled_at.is_none() {
                request.fulfilled_at = Some(fulfilled_at);
            }
        }
        Ok(())
    }

    async fn unlink_request(
        &self,
        request_id: TrialRequestId,
    ) -> Result<(), TrialRepositoryError> {
        let mut requests = lock(&self.requests, "trial requests");
        let request = requests
            .get_mut(&request_id)
            .ok_or_else(|| TrialRepositoryError::query("request not found"))?;
        request.trial_id = None;
        Ok(())
    }
}

/// Credit ledger with the production flooring rule.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: Mutex<HashMap<UserId, i64>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: &UserId, balance: i64) {
        lock(&self.balances, "ledger").insert(user_id.clone(), balance.max(0));
    }

    pub fn balance_of(&self, user_id: &UserId) -> i64 {
        lock(&self.balances, "ledger").get(user_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn balance(&self, user_id: &UserId) -> Result<i64, CreditLedgerError> {
        Ok(self.balance_of(user_id))
    }

    async fn adjust(&self, user_id: &UserId, delta: i64) -> Result<i64, CreditLedgerError> {
        let mut balances = lock(&self.balances, "ledger");
        let entry = balances.entry(user_id.clone()).or_insert(0);
        *entry = entry.saturating_add(delta).max(0);
        Ok(*entry)
    }
}

/// Provider rows held in a map.
#[derive(Default)]
pub struct InMemoryProviderRepository {
    providers: Mutex<HashMap<ProviderId, Provider>>,
}

impl InMemoryProviderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, provider: Provider) {
        lock(&self.providers, "providers").insert(provider.id, provider);
    }
}

#[async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn find_by_id(
        &self,
        provider_id: ProviderId,
    ) -> Result<Option<Provider>, ProviderRepositoryError> {
        Ok(lock(&self.providers, "providers").get(&provider_id).cloned())
    }
}

/// Storage sink recording uploads and deletes.
#[derive(Default)]
pub struct RecordingStorageSink {
    uploads: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingStorageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        lock(&self.uploads, "uploads").clone()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        lock(&self.deletes, "deletes").clone()
    }
}

#[async_trait]
impl StorageSink for RecordingStorageSink {
    async fn upload(&self, _bytes: Vec<u8>, key: &str) -> Result<String, StorageSinkError> {
        lock(&self.uploads, "uploads").push(key.to_owned());
        Ok(format!("https://storage.invalid/{key}"))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageSinkError> {
        lock(&self.deletes, "deletes").push(key.to_owned());
        Ok(())
    }
}

/// Gateway replaying scripted responses, falling back to a one-pixel image.
#[derive(Default)]
pub struct ScriptedProviderGateway {
    script: Mutex<Vec<Result<GatewayImage, ProviderGatewayError>>>,
    invocations: Mutex<Vec<GatewayPayload>>,
}

impl ScriptedProviderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response; scripted responses are consumed in order.
    pub fn push(&self, response: Result<GatewayImage, ProviderGatewayError>) {
        lock(&self.script, "gateway script").push(response);
    }

    pub fn invocation_count(&self) -> usize {
        lock(&self.invocations, "gateway invocations").len()
    }

    pub fn invocations(&self) -> Vec<GatewayPayload> {
        lock(&self.invocations, "gateway invocations").clone()
    }

    fn default_image() -> GatewayImage {
        GatewayImage {
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
            attributes: ImageAttributes {
                width: 1024,
                height: 1024,
                color: Some("1f2d3c".to_owned()),
            },
        }
    }
}

#[async_trait]
impl ProviderGateway for ScriptedProviderGateway {
    async fn invoke(
        &self,
        _endpoint: &Url,
        _auth_token: &str,
        payload: &GatewayPayload,
        _timeout: Duration,
    ) -> Result<GatewayImage, ProviderGatewayError> {
        lock(&self.invocations, "gateway invocations").push(payload.clone());
        let mut script = lock(&self.script, "gateway script");
        if script.is_empty() {
            Ok(Self::default_image())
        } else {
            script.remove(0)
        }
    }
}

/// Queue recording jobs for the test to execute deterministically.
#[derive(Default)]
pub struct RecordingJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl RecordingJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every job enqueued so far.
    pub fn drain(&self) -> Vec<QueuedJob> {
        std::mem::take(&mut *lock(&self.jobs, "queued jobs"))
    }
}

#[async_trait]
impl JobQueue for RecordingJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), JobDispatchError> {
        lock(&self.jobs, "queued jobs").push(job);
        Ok(())
    }
}

/// An active provider rooted at a fixed test endpoint.
pub fn test_provider(id: i64, owner: &UserId) -> Provider {
    Provider {
        id: ProviderId::new(id),
        base_url: Url::parse("https://provider.test/").unwrap_or_else(|error| {
            panic!("static test URL must parse: {error}")
        }),
        auth_token: "test-token".to_owned(),
        status: ProviderStatus::Active,
        owner_user_id: owner.clone(),
    }
}
