mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use userbot_rust::session::{SessionError, SessionRegistry, SessionSettings, StartOutcome, StopOutcome};
use userbot_rust::store::FileCredentialStore;
use userbot_rust::ubcore::completion::{Completion, CompletionError, CompletionProvider};
use userbot_rust::ubcore::conversation::HistoryEntry;
use userbot_rust::ubcore::{AccountKey, ChatKey};
use userbot_rust::ubcore::crypto::AesGcmSealer;
use userbot_rust::ubcore::store::CredentialStore;

fn registry(h: &Harness) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        Arc::new(h.provider.clone()),
        Arc::new(h.store.clone()),
        h.completion.clone(),
        SessionSettings::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_have_one_winner() {
    const CALLERS: usize = 16;
    let h = harness().await;
    let credential = seeded_credential(&h.provider, PHONE);
    let registry = registry(&h);

    let mut tasks = Vec::new();
    for _ in 0..CALLERS {
        let registry = registry.clone();
        let credential = credential.clone();
        tasks.push(tokio::spawn(async move {
            registry.start_or_attach(&credential).await
        }));
    }
    let mut started = 0;
    let mut already_running = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            StartOutcome::Started { .. } => started += 1,
            StartOutcome::AlreadyRunning => already_running += 1,
        }
    }
    assert_eq!(started, 1);
    assert_eq!(already_running, CALLERS - 1);
    assert_eq!(h.provider.subscriber_count(&credential.account_key), 1);
    assert_eq!(h.provider.open_connections(), 1);

    assert_eq!(
        registry.stop(&credential.account_key).await.unwrap(),
        StopOutcome::Stopped
    );
    assert_eq!(
        registry.stop(&credential.account_key).await.unwrap(),
        StopOutcome::NotRunning
    );
    assert_eq!(h.provider.open_connections(), 0);
    assert_eq!(h.provider.subscriber_count(&credential.account_key), 0);
}

/// Holds every reply until a permit is added.
struct GatedCompletion {
    gate: Semaphore,
    started: AtomicUsize,
}

impl Default for GatedCompletion {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::default(),
        }
    }
}

#[async_trait]
impl CompletionProvider for GatedCompletion {
    async fn generate_reply(&self, _history: &[HistoryEntry]) -> Result<Completion, CompletionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        Ok(Completion {
            text: "slow reply".to_string(),
            continuation: None,
        })
    }
}

#[tokio::test]
async fn racing_stops_both_succeed() {
    let h = harness().await;
    let credential = seeded_credential(&h.provider, PHONE);
    let key = &credential.account_key;
    let completion = Arc::new(GatedCompletion::default());
    let registry = SessionRegistry::new(
        Arc::new(h.provider.clone()),
        Arc::new(h.store.clone()),
        completion.clone(),
        SessionSettings::default(),
    );
    registry.start_or_attach(&credential).await.unwrap();
    assert!(registry.get(key).unwrap().arm_chat(ChatKey(42)).await);

    h.provider.deliver(key, message(42, 1, false, "hello")).await;
    while completion.started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let release = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        completion.gate.add_permits(1);
    };
    let (first, second, ()) = tokio::join!(registry.stop(key), registry.stop(key), release);
    assert_eq!(first.unwrap(), StopOutcome::Stopped);
    assert_eq!(second.unwrap(), StopOutcome::NotRunning);

    let replies: Vec<_> = h.provider.sent_replies().into_iter().map(|r| r.text).collect();
    assert_eq!(replies, vec!["slow reply".to_string()]);
    assert_eq!(h.provider.open_connections(), 0);
    assert!(registry.running_accounts().is_empty());
    assert_eq!(registry.stop(key).await.unwrap(), StopOutcome::NotRunning);
}

#[tokio::test]
async fn one_broken_account_does_not_block_restore() {
    let h = harness().await;
    let good = seeded_credential(&h.provider, "+15550000001");
    let broken = seeded_credential(&h.provider, PHONE);
    h.provider.revoke_session(&broken.connection_handle_ref);
    h.store.save(&good.account_key, &good).await.unwrap();
    h.store.save(&broken.account_key, &broken).await.unwrap();

    let results = h.plane.restore_all().await.unwrap();
    assert_eq!(results.len(), 2);
    for (key, result) in &results {
        if key == &good.account_key {
            assert!(matches!(result, Ok(StartOutcome::Started { .. })));
        } else {
            assert!(matches!(result, Err(SessionError::NotAuthorized(_))));
        }
    }
    assert_eq!(h.plane.running_accounts(), vec![good.account_key.clone()]);
    h.plane.shutdown().await;
}

#[tokio::test]
async fn sealed_file_store_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let credential = seeded_credential(&demo_provider(), PHONE);
    let sealer = || Arc::new(AesGcmSealer::from_secret(b"operator secret", None).unwrap());

    {
        let store = FileCredentialStore::new(dir.path(), sealer()).await.unwrap();
        store.save(&credential.account_key, &credential).await.unwrap();
    }
    let on_disk = std::fs::read(dir.path().join("15550000000.cred")).unwrap();
    assert!(!String::from_utf8_lossy(&on_disk).contains("0123456789abcdef"));

    let store = FileCredentialStore::new(dir.path(), sealer()).await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec![AccountKey::from_phone(PHONE)]);
    let loaded = store.load(&credential.account_key).await.unwrap().unwrap();
    assert!(loaded == credential);

    let wrong_key = FileCredentialStore::new(
        dir.path(),
        Arc::new(AesGcmSealer::from_secret(b"another secret", None).unwrap()),
    )
    .await
    .unwrap();
    assert!(wrong_key.load(&credential.account_key).await.is_err());
}
