//! Backend connector: replays local crud transactions against Supabase and
//! hands session credentials to the sync engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use counter_sync_core::{
    AuthProvider, BackendConnector, ConnectorEvent, Credentials, ListenerId, MutationOp,
    MutationQueue, Observer, OpKind, RemoteError, RemoteStore, Result, Session, SyncError,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub struct SupabaseConnector {
    powersync_url: String,
    auth: Arc<dyn AuthProvider>,
    remote: Arc<dyn RemoteStore>,
    current_session: RwLock<Option<Session>>,
    ready: AtomicBool,
    /// Set while an anonymous sign-in request is outstanding.
    signing_in: AtomicBool,
    listeners: Observer<ConnectorEvent>,
}

impl SupabaseConnector {
    pub fn new(
        powersync_url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            powersync_url: powersync_url.into(),
            auth,
            remote,
            current_session: RwLock::new(None),
            ready: AtomicBool::new(false),
            signing_in: AtomicBool::new(false),
            listeners: Observer::new(),
        }
    }

    /// Restore any stored session and announce readiness.
    pub async fn init(&self) {
        match self.auth.get_session().await {
            Ok(Some(session)) => {
                info!("Restored session for user {}", session.user.id);
                self.update_session(Some(session)).await;
            }
            Ok(None) => debug!("No stored session"),
            Err(e) => warn!("Could not restore session: {}", e),
        }
        self.ready.store(true, Ordering::Release);
        self.listeners.notify(&ConnectorEvent::Initialized);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn register_listener(
        &self,
        callback: impl Fn(&ConnectorEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.register(callback)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.listeners.unregister(id);
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.current_session.read().await.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.current_session
            .read()
            .await
            .as_ref()
            .map(|s| s.user.id.clone())
    }

    /// Sign in as a new anonymous user unless a session already exists.
    ///
    /// A call made while another sign-in is still in flight returns
    /// immediately without contacting the auth service.
    pub async fn sign_in_anonymously(&self) -> Result<()> {
        if self.current_session.read().await.is_some() {
            debug!("Session already present, skipping anonymous sign-in");
            return Ok(());
        }
        if self.signing_in.swap(true, Ordering::AcqRel) {
            debug!("Anonymous sign-in already in progress");
            return Ok(());
        }

        // The flag stays set until the session is visible to other callers.
        let result = self.auth.sign_in_anonymously().await;
        if let Ok(session) = &result {
            info!("Signed in anonymously as {}", session.user.id);
            self.update_session(Some(session.clone())).await;
        }
        self.signing_in.store(false, Ordering::Release);

        result?;
        Ok(())
    }

    /// Email/password sign-in. Replaces any current session.
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        self.update_session(Some(session)).await;
        Ok(())
    }

    pub async fn logout(&self) {
        if let Err(e) = self.auth.sign_out().await {
            warn!("Sign-out request failed: {}", e);
        }
        self.update_session(None).await;
        self.listeners.notify(&ConnectorEvent::SessionEnded);
    }

    async fn update_session(&self, session: Option<Session>) {
        *self.current_session.write().await = session.clone();
        if let Some(session) = session {
            self.listeners.notify(&ConnectorEvent::SessionStarted(session));
        }
    }

    async fn apply(&self, op: &MutationOp) -> std::result::Result<(), RemoteError> {
        match op.kind {
            OpKind::Put => self.remote.upsert(&op.table, &op.upsert_row()).await,
            OpKind::Patch => self.remote.update(&op.table, &op.patch_data(), &op.id).await,
            OpKind::Delete => self.remote.delete(&op.table, &op.id).await,
        }
    }
}

#[async_trait]
impl BackendConnector for SupabaseConnector {
    async fn fetch_credentials(&self) -> Result<Credentials> {
        let session = match self.auth.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(SyncError::NoSession("no active session".to_string())),
            Err(e) => return Err(SyncError::NoSession(e.to_string())),
        };

        debug!("Session expires at {:?}", session.expires_at);

        Ok(Credentials {
            endpoint: self.powersync_url.clone(),
            token: session.access_token,
            expires_at: session.expires_at,
        })
    }

    async fn upload_data(&self, queue: &dyn MutationQueue) -> Result<()> {
        let Some(transaction) = queue.next_pending_transaction().await? else {
            return Ok(());
        };

        debug!(
            tx_id = transaction.tx_id,
            ops = transaction.ops.len(),
            "Uploading transaction"
        );

        // Ops run one at a time: later ops may depend on earlier ones.
        for op in &transaction.ops {
            let Err(err) = self.apply(op).await else {
                continue;
            };

            if err.is_fatal() {
                // Retrying cannot fix this and would block every later
                // transaction, so drop the rest of this one.
                error!(
                    tx_id = transaction.tx_id,
                    op = ?op.kind,
                    table = %op.table,
                    id = %op.id,
                    error = %err,
                    "Data upload error - discarding transaction"
                );
                queue.complete(&transaction).await?;
                return Ok(());
            }

            warn!(
                tx_id = transaction.tx_id,
                table = %op.table,
                id = %op.id,
                error = %err,
                "Upload failed, transaction stays queued"
            );
            return Err(SyncError::Remote(err));
        }

        queue.complete(&transaction).await?;
        debug!(tx_id = transaction.tx_id, "Transaction uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use counter_sync_core::{AuthError, MemoryMutationQueue, User};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map, Value};
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Upsert(String, Value),
        Update(String, Value, String),
        Delete(String, String),
    }

    /// Records every call; fails the calls whose index has a scripted error.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Call>>,
        failures: Mutex<HashMap<usize, RemoteError>>,
    }

    impl RecordingStore {
        fn fail_call(&self, index: usize, err: RemoteError) {
            self.failures.lock().unwrap().insert(index, err);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> std::result::Result<(), RemoteError> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.len();
            calls.push(call);
            match self.failures.lock().unwrap().remove(&index) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteStore for RecordingStore {
        async fn upsert(
            &self,
            table: &str,
            row: &Map<String, Value>,
        ) -> std::result::Result<(), RemoteError> {
            self.record(Call::Upsert(table.to_string(), Value::Object(row.clone())))
        }

        async fn update(
            &self,
            table: &str,
            patch: &Map<String, Value>,
            id: &str,
        ) -> std::result::Result<(), RemoteError> {
            self.record(Call::Update(
                table.to_string(),
                Value::Object(patch.clone()),
                id.to_string(),
            ))
        }

        async fn delete(&self, table: &str, id: &str) -> std::result::Result<(), RemoteError> {
            self.record(Call::Delete(table.to_string(), id.to_string()))
        }
    }

    #[derive(Default)]
    struct FakeAuth {
        session: Mutex<Option<Session>>,
        sign_in_calls: AtomicUsize,
        sign_in_error: Mutex<Option<AuthError>>,
        /// When set, sign-in announces itself on `entered` and waits here.
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn get_session(&self) -> std::result::Result<Option<Session>, AuthError> {
            Ok(self.session.lock().unwrap().clone())
        }

        async fn sign_in_anonymously(&self) -> std::result::Result<Session, AuthError> {
            let n = self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                self.entered.notify_one();
                gate.notified().await;
            }
            if let Some(err) = self.sign_in_error.lock().unwrap().clone() {
                return Err(err);
            }
            let session = test_session(&format!("anon-{}", n + 1));
            *self.session.lock().unwrap() = Some(session.clone());
            Ok(session)
        }

        async fn sign_in_with_password(
            &self,
            email: &str,
            _password: &str,
        ) -> std::result::Result<Session, AuthError> {
            let mut session = test_session("member");
            session.user.email = Some(email.to_string());
            session.user.is_anonymous = false;
            *self.session.lock().unwrap() = Some(session.clone());
            Ok(session)
        }

        async fn sign_out(&self) -> std::result::Result<(), AuthError> {
            self.session.lock().unwrap().take();
            Err(AuthError::Http("network down".to_string()))
        }
    }

    fn test_session(user_id: &str) -> Session {
        Session {
            access_token: format!("token-{}", user_id),
            refresh_token: "refresh".to_string(),
            expires_at: None,
            user: User {
                id: user_id.to_string(),
                email: None,
                is_anonymous: true,
            },
        }
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (SupabaseConnector, Arc<RecordingStore>, Arc<FakeAuth>) {
        let store = Arc::new(RecordingStore::default());
        let auth = Arc::new(FakeAuth::default());
        let connector =
            SupabaseConnector::new("https://sync.example.com", auth.clone(), store.clone());
        (connector, store, auth)
    }

    fn three_op_transaction(queue: &MemoryMutationQueue) {
        queue.push(vec![
            MutationOp::put("counters", "1", data(json!({"count": 0}))),
            MutationOp::patch("counters", "1", data(json!({"count": 1}))),
            MutationOp::delete("counters", "1"),
        ]);
    }

    #[tokio::test]
    async fn test_upload_empty_queue_is_noop() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        connector.upload_data(&queue).await.unwrap();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upload_replays_in_order_and_completes() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        three_op_transaction(&queue);

        connector.upload_data(&queue).await.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                Call::Upsert("counters".to_string(), json!({"count": 0, "id": "1"})),
                Call::Update("counters".to_string(), json!({"count": 1}), "1".to_string()),
                Call::Delete("counters".to_string(), "1".to_string()),
            ]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_upload_one_transaction_per_call() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        queue.push(vec![MutationOp::delete("counters", "a")]);
        queue.push(vec![MutationOp::delete("counters", "b")]);

        connector.upload_data(&queue).await.unwrap();
        assert_eq!(store.calls().len(), 1);
        assert_eq!(queue.len(), 1);

        connector.upload_data(&queue).await.unwrap();
        assert_eq!(store.calls().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fatal_error_discards_transaction() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        three_op_transaction(&queue);
        queue.push(vec![MutationOp::delete("counters", "next")]);
        store.fail_call(1, RemoteError::new("23505", "duplicate key"));

        connector.upload_data(&queue).await.unwrap();

        // Op 3 of the failed transaction was never sent.
        assert_eq!(store.calls().len(), 2);
        assert!(matches!(store.calls()[1], Call::Update(..)));
        assert!(logs_contain("Data upload error - discarding transaction"));
        assert!(logs_contain("duplicate key"));

        // The queue moved on to the next transaction.
        let head = queue.next_pending_transaction().await.unwrap().unwrap();
        assert_eq!(head.ops, vec![MutationOp::delete("counters", "next")]);
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        queue.push(vec![MutationOp::delete("counters", "theirs")]);
        store.fail_call(0, RemoteError::new("42501", "new row violates row-level security"));

        connector.upload_data(&queue).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_keeps_transaction() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        three_op_transaction(&queue);
        store.fail_call(1, RemoteError::transport("connection reset"));

        let err = connector.upload_data(&queue).await.unwrap_err();
        assert!(matches!(&err, SyncError::Remote(e) if e.code.is_none()));
        assert!(err.is_retryable());
        assert_eq!(store.calls().len(), 2);
        assert_eq!(queue.len(), 1);

        // Redelivered from the first op.
        connector.upload_data(&queue).await.unwrap();
        let calls = store.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[2], calls[0]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_code_is_transient() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        queue.push(vec![MutationOp::delete("counters", "a")]);
        store.fail_call(0, RemoteError::new("PGRST301", "JWT expired"));

        let err = connector.upload_data(&queue).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_put_injects_id() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        queue.push(vec![MutationOp::put(
            "counters",
            "abc",
            data(json!({"owner_id": "u1", "count": 0, "created_at": "T"})),
        )]);

        connector.upload_data(&queue).await.unwrap();
        assert_eq!(
            store.calls(),
            vec![Call::Upsert(
                "counters".to_string(),
                json!({"owner_id": "u1", "count": 0, "created_at": "T", "id": "abc"})
            )]
        );
    }

    #[tokio::test]
    async fn test_put_then_patch_scenario() {
        let (connector, store, _) = setup();
        let queue = MemoryMutationQueue::new();
        queue.push(vec![
            MutationOp::put("counters", "1", data(json!({"count": 0}))),
            MutationOp::patch("counters", "1", data(json!({"count": 5}))),
        ]);

        connector.upload_data(&queue).await.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                Call::Upsert("counters".to_string(), json!({"count": 0, "id": "1"})),
                Call::Update("counters".to_string(), json!({"count": 5}), "1".to_string()),
            ]
        );
        assert!(queue.next_pending_transaction().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_credentials_without_session() {
        let (connector, store, _) = setup();
        let err = connector.fetch_credentials().await.unwrap_err();
        assert!(matches!(err, SyncError::NoSession(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_credentials() {
        let (connector, _, auth) = setup();
        *auth.session.lock().unwrap() = Some(test_session("u1"));

        let creds = connector.fetch_credentials().await.unwrap();
        assert_eq!(creds.endpoint, "https://sync.example.com");
        assert_eq!(creds.token, "token-u1");
    }

    #[tokio::test]
    async fn test_sign_in_anonymously_once() {
        let (connector, _, auth) = setup();
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        connector.register_listener(move |event| {
            if matches!(event, ConnectorEvent::SessionStarted(_)) {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        connector.sign_in_anonymously().await.unwrap();
        connector.sign_in_anonymously().await.unwrap();

        assert_eq!(auth.sign_in_calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(connector.user_id().await.as_deref(), Some("anon-1"));
    }

    #[tokio::test]
    async fn test_concurrent_sign_in_is_deduplicated() {
        let gate = Arc::new(Notify::new());
        let auth = Arc::new(FakeAuth {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let connector = Arc::new(SupabaseConnector::new(
            "https://sync.example.com",
            auth.clone(),
            Arc::new(RecordingStore::default()),
        ));

        let first = tokio::spawn({
            let connector = connector.clone();
            async move { connector.sign_in_anonymously().await }
        });
        auth.entered.notified().await;

        // Returns at once while the first request is outstanding.
        connector.sign_in_anonymously().await.unwrap();
        assert!(connector.current_session().await.is_none());

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(auth.sign_in_calls.load(Ordering::SeqCst), 1);
        assert!(connector.current_session().await.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_flag_held_until_session_stored() {
        let (connector, _, auth) = setup();
        let connector = Arc::new(connector);
        let flag_seen = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&connector);
        let seen = flag_seen.clone();
        connector.register_listener(move |event| {
            if let (ConnectorEvent::SessionStarted(_), Some(c)) = (event, weak.upgrade()) {
                *seen.lock().unwrap() = Some(c.signing_in.load(Ordering::SeqCst));
            }
        });

        connector.sign_in_anonymously().await.unwrap();
        assert_eq!(*flag_seen.lock().unwrap(), Some(true));
        assert!(!connector.signing_in.load(Ordering::SeqCst));

        connector.sign_in_anonymously().await.unwrap();
        assert_eq!(auth.sign_in_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_in_failure_propagates() {
        let (connector, _, auth) = setup();
        *auth.sign_in_error.lock().unwrap() = Some(AuthError::Rejected {
            status: 422,
            message: "Anonymous sign-ins are disabled".to_string(),
        });

        let err = connector.sign_in_anonymously().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(AuthError::Rejected { status: 422, .. })));
        assert!(connector.current_session().await.is_none());

        // The in-flight flag was released, so a retry reaches the provider.
        auth.sign_in_error.lock().unwrap().take();
        connector.sign_in_anonymously().await.unwrap();
        assert_eq!(auth.sign_in_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_login_replaces_session() {
        let (connector, _, _) = setup();
        connector.sign_in_anonymously().await.unwrap();
        connector.login("a@b.c", "pw").await.unwrap();

        let session = connector.current_session().await.unwrap();
        assert_eq!(session.user.email.as_deref(), Some("a@b.c"));
    }

    #[tokio::test]
    async fn test_logout_clears_session_and_notifies() {
        let (connector, _, _) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        connector.register_listener(move |event| e.lock().unwrap().push(event.clone()));

        connector.sign_in_anonymously().await.unwrap();
        // The fake sign-out fails; the local session is cleared regardless.
        connector.logout().await;

        assert!(connector.current_session().await.is_none());
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ConnectorEvent::SessionStarted(_)));
        assert_eq!(events[1], ConnectorEvent::SessionEnded);
    }

    #[tokio::test]
    async fn test_init_restores_session() {
        let (connector, _, auth) = setup();
        *auth.session.lock().unwrap() = Some(test_session("stored"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let id = connector.register_listener(move |event| e.lock().unwrap().push(event.clone()));

        assert!(!connector.is_ready());
        connector.init().await;
        assert!(connector.is_ready());
        assert_eq!(connector.user_id().await.as_deref(), Some("stored"));
        assert_eq!(
            events.lock().unwrap().clone(),
            vec![
                ConnectorEvent::SessionStarted(test_session("stored")),
                ConnectorEvent::Initialized,
            ]
        );

        connector.unregister_listener(id);
        connector.logout().await;
        assert_eq!(events.lock().unwrap().len(), 2);

        // A restored session short-circuits anonymous sign-in too.
        *auth.session.lock().unwrap() = Some(test_session("stored"));
        connector.init().await;
        connector.sign_in_anonymously().await.unwrap();
        assert_eq!(auth.sign_in_calls.load(Ordering::SeqCst), 0);
    }
}
