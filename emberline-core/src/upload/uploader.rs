//! Single-flight upload coordination
//!
//! At most one upload runs per API key at any time within the process. A
//! second `upload()` call arriving while one is in flight does not start a
//! parallel upload; it flips a rerun flag and returns immediately, and the
//! active upload performs one more pass before finishing so the coalesced
//! request's events are still delivered.
//!
//! An upload pass drains the queue: previously cut blobs are re-sent
//! oldest-first, then new blobs are cut and sent until nothing qualifies or
//! a transient failure stops the pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Duration;

use crate::config::{TrackerConfig, UploaderConfig};
use crate::db::Database;
use crate::error::Result;
use crate::types::{Account, EventKind, Session, UploadBlob};

use super::client::{UploadClient, UploadOutcome};
use super::payload::{self, BlobHeader};

/// Delivery seam for the uploader.
///
/// `UploadClient` is the production implementation; tests substitute scripted
/// transports to exercise the commit/retry contract without a network.
pub trait BlobTransport: Send + Sync {
    /// Deliver one rendered blob payload for an API key
    fn deliver(
        &self,
        api_key: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<UploadOutcome>> + Send;
}

impl BlobTransport for UploadClient {
    async fn deliver(&self, api_key: &str, payload: Vec<u8>) -> Result<UploadOutcome> {
        self.send_blob(api_key, payload).await
    }
}

/// Result of an upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRun {
    /// This call performed the upload
    Completed(UploadStats),
    /// Another upload was in flight for this key; it will run one more pass
    Coalesced,
}

/// Counters for one completed upload call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    /// Blobs accepted by the collector and committed
    pub blobs_delivered: usize,
    /// Blobs permanently rejected by the collector and committed
    pub blobs_discarded: usize,
    /// Events removed from the queue (delivered or discarded)
    pub events_uploaded: usize,
    /// Blobs left queued after a transient failure
    pub blobs_retained: usize,
}

/// Per-key in-flight state, shared by every uploader in the process.
#[derive(Default)]
struct FlightState {
    in_flight: bool,
    rerun: bool,
}

static FLIGHTS: OnceLock<Mutex<HashMap<String, Arc<Mutex<FlightState>>>>> = OnceLock::new();

fn flight_for(api_key: &str) -> Arc<Mutex<FlightState>> {
    let registry = FLIGHTS.get_or_init(|| Mutex::new(HashMap::new()));
    registry
        .lock()
        .unwrap()
        .entry(api_key.to_string())
        .or_default()
        .clone()
}

/// Drives blob cutting and delivery for one account.
pub struct Uploader<T: BlobTransport> {
    db: Database,
    transport: T,
    account: Account,
    reconnect_window: Duration,
    flight: Arc<Mutex<FlightState>>,
}

impl Uploader<UploadClient> {
    /// Create an uploader backed by the HTTP client
    pub fn new(
        db: Database,
        api_key: &str,
        tracker: &TrackerConfig,
        uploader: &UploaderConfig,
    ) -> Result<Self> {
        let client = UploadClient::new(uploader)?;
        Self::with_transport(db, api_key, tracker, client)
    }
}

impl<T: BlobTransport> Uploader<T> {
    /// Create an uploader with a custom transport
    pub fn with_transport(
        db: Database,
        api_key: &str,
        tracker: &TrackerConfig,
        transport: T,
    ) -> Result<Self> {
        let account = db.ensure_account(api_key)?;
        let flight = flight_for(api_key);
        Ok(Self {
            db,
            transport,
            account,
            reconnect_window: Duration::seconds(tracker.reconnect_window_secs as i64),
            flight,
        })
    }

    /// Access the underlying transport (for advanced use and tests)
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Upload everything currently eligible for this account.
    ///
    /// If an upload is already in flight for the API key, the request is
    /// coalesced into that upload's final pass and `Coalesced` is returned.
    pub async fn upload(&self) -> Result<UploadRun> {
        if !self.begin_flight() {
            tracing::debug!(api_key = %self.account.api_key, "Upload in flight, coalescing request");
            return Ok(UploadRun::Coalesced);
        }

        let mut stats = UploadStats::default();
        loop {
            if let Err(e) = self.drain_queue(&mut stats).await {
                self.abort_flight();
                return Err(e);
            }
            if !self.finish_or_rerun() {
                break;
            }
            tracing::debug!("Running extra pass for coalesced upload request");
        }

        tracing::info!(
            delivered = stats.blobs_delivered,
            discarded = stats.blobs_discarded,
            events = stats.events_uploaded,
            retained = stats.blobs_retained,
            "Upload finished"
        );
        Ok(UploadRun::Completed(stats))
    }

    /// Send blobs until the queue is drained or a transient failure stops us.
    async fn drain_queue(&self, stats: &mut UploadStats) -> Result<()> {
        loop {
            let blob = match self.db.oldest_open_blob(self.account.id)? {
                Some(blob) => blob,
                None => match self.db.cut_blob(self.account.id, self.reconnect_window)? {
                    Some(blob) => blob,
                    None => return Ok(()),
                },
            };

            let (bytes, event_count) = self.render_blob(&blob)?;
            match self
                .transport
                .deliver(&self.account.api_key, bytes)
                .await?
            {
                UploadOutcome::Accepted { status } => {
                    self.db.commit_blob(&blob.id)?;
                    stats.blobs_delivered += 1;
                    stats.events_uploaded += event_count;
                    tracing::info!(blob_id = %blob.id, status, events = event_count, "Blob delivered");
                }
                UploadOutcome::Discarded { status } => {
                    self.db.commit_blob(&blob.id)?;
                    stats.blobs_discarded += 1;
                    stats.events_uploaded += event_count;
                    tracing::warn!(blob_id = %blob.id, status, "Blob rejected by collector, dropping");
                }
                UploadOutcome::Retriable { status, reason } => {
                    stats.blobs_retained += 1;
                    tracing::warn!(blob_id = %blob.id, ?status, %reason, "Upload failed, keeping blob for retry");
                    return Ok(());
                }
            }
        }
    }

    /// Render a blob's header and event lines to the gzip payload
    fn render_blob(&self, blob: &UploadBlob) -> Result<(Vec<u8>, usize)> {
        let events = self.db.blob_events(&blob.id)?;

        let mut sessions: HashMap<String, Session> = HashMap::new();
        let mut lines = Vec::with_capacity(events.len());
        for event in &events {
            let session = match &event.session_id {
                Some(session_id) => {
                    if !sessions.contains_key(session_id) {
                        if let Some(session) = self.db.get_session(session_id)? {
                            sessions.insert(session_id.clone(), session);
                        }
                    }
                    sessions.get(session_id)
                }
                None => None,
            };

            let flow = match (&event.kind, &event.session_id) {
                (EventKind::Close, Some(session_id)) => self.db.blob_flow(&blob.id, session_id)?,
                _ => Vec::new(),
            };

            lines.push(payload::render_event(event, session, &flow));
        }

        let header = BlobHeader::new(&self.account, blob);
        let bytes = payload::build_payload(&header, &lines)?;
        Ok((bytes, events.len()))
    }

    /// Try to become the in-flight upload for this key
    fn begin_flight(&self) -> bool {
        let mut state = self.flight.lock().unwrap();
        if state.in_flight {
            state.rerun = true;
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Atomically either pick up a coalesced request (true: run another pass)
    /// or release the in-flight flag (false: done).
    fn finish_or_rerun(&self) -> bool {
        let mut state = self.flight.lock().unwrap();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.in_flight = false;
            false
        }
    }

    /// Release the flag after a failed pass without honoring reruns
    fn abort_flight(&self) {
        let mut state = self.flight.lock().unwrap();
        state.in_flight = false;
        state.rerun = false;
    }
}

/// Synchronous wrapper for [`Uploader`]
///
/// Provides blocking methods for use in synchronous code.
pub struct SyncUploader {
    inner: Uploader<UploadClient>,
    runtime: tokio::runtime::Runtime,
}

impl SyncUploader {
    /// Create a new sync uploader from configuration
    ///
    /// Returns None if the uploader is not enabled or not properly configured.
    pub fn new(
        db: Database,
        api_key: &str,
        tracker: &TrackerConfig,
        uploader: &UploaderConfig,
    ) -> Result<Option<Self>> {
        if !uploader.is_ready() {
            return Ok(None);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| crate::error::Error::Upload(format!("failed to create runtime: {}", e)))?;

        let inner = Uploader::new(db, api_key, tracker, uploader)?;
        Ok(Some(Self { inner, runtime }))
    }

    /// Upload everything currently eligible (blocking)
    pub fn upload(&self) -> Result<UploadRun> {
        self.runtime.block_on(self.inner.upload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::SessionTracker;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Returns outcomes from a script, recording every delivered payload.
    /// Falls back to Accepted once the script is exhausted.
    struct ScriptedTransport {
        script: StdMutex<VecDeque<UploadOutcome>>,
        deliveries: StdMutex<Vec<Vec<u8>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<UploadOutcome>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                deliveries: StdMutex::new(Vec::new()),
            }
        }

        fn delivery_count(&self) -> usize {
            self.deliveries.lock().unwrap().len()
        }

        fn delivery(&self, index: usize) -> Vec<u8> {
            self.deliveries.lock().unwrap()[index].clone()
        }
    }

    impl BlobTransport for ScriptedTransport {
        async fn deliver(&self, _api_key: &str, payload: Vec<u8>) -> Result<UploadOutcome> {
            self.deliveries.lock().unwrap().push(payload);
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(UploadOutcome::Accepted { status: 200 }))
        }
    }

    fn zero_window() -> TrackerConfig {
        TrackerConfig {
            reconnect_window_secs: 0,
            max_attributes: 10,
        }
    }

    /// Unique key per test: the flight registry is process-global.
    fn unique_key() -> String {
        format!("em_test_{}", Uuid::new_v4())
    }

    fn seed_closed_session(dir: &TempDir, api_key: &str) {
        let db_path = dir.path().join("queue.db");
        let db = Database::open(&db_path).unwrap();
        db.migrate().unwrap();
        let tracker = SessionTracker::new(db, api_key, &zero_window()).unwrap();
        tracker.open_session().unwrap();
        tracker.tag_event("purchase", &[]).unwrap();
        tracker.close_session().unwrap();
    }

    fn open_db(dir: &TempDir) -> Database {
        let db = Database::open(&dir.path().join("queue.db")).unwrap();
        db.migrate().unwrap();
        db
    }

    #[tokio::test]
    async fn test_accepted_upload_commits_queue() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();
        seed_closed_session(&dir, &key);

        let transport = ScriptedTransport::new(vec![]);
        let uploader =
            Uploader::with_transport(open_db(&dir), &key, &zero_window(), transport).unwrap();

        let run = uploader.upload().await.unwrap();
        let UploadRun::Completed(stats) = run else {
            panic!("expected completed run");
        };
        assert_eq!(stats.blobs_delivered, 1);
        assert_eq!(stats.events_uploaded, 3);

        let db = open_db(&dir);
        let account = db.ensure_account(&key).unwrap();
        let queue = db.queue_stats(account.id).unwrap();
        assert_eq!(queue.unclaimed_events, 0);
        assert_eq!(queue.open_blobs, 0);
    }

    #[tokio::test]
    async fn test_server_error_keeps_blob_and_resends_verbatim() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();
        seed_closed_session(&dir, &key);

        let transport = ScriptedTransport::new(vec![UploadOutcome::Retriable {
            status: Some(503),
            reason: "server error (503)".to_string(),
        }]);
        let uploader =
            Uploader::with_transport(open_db(&dir), &key, &zero_window(), transport).unwrap();

        let UploadRun::Completed(stats) = uploader.upload().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(stats.blobs_delivered, 0);
        assert_eq!(stats.blobs_retained, 1);

        // Blob survives the failed attempt
        {
            let db = open_db(&dir);
            let account = db.ensure_account(&key).unwrap();
            assert_eq!(db.queue_stats(account.id).unwrap().open_blobs, 1);
        }

        // The next explicit upload call re-sends the same blob and commits
        let UploadRun::Completed(stats) = uploader.upload().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(stats.blobs_delivered, 1);

        assert_eq!(uploader.transport.delivery_count(), 2);
        assert_eq!(
            uploader.transport.delivery(0),
            uploader.transport.delivery(1),
            "retry must re-send the identical blob payload"
        );

        let db = open_db(&dir);
        let account = db.ensure_account(&key).unwrap();
        assert_eq!(db.queue_stats(account.id).unwrap().open_blobs, 0);
    }

    #[tokio::test]
    async fn test_permanent_rejection_drops_blob() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();
        seed_closed_session(&dir, &key);

        let transport =
            ScriptedTransport::new(vec![UploadOutcome::Discarded { status: 400 }]);
        let uploader =
            Uploader::with_transport(open_db(&dir), &key, &zero_window(), transport).unwrap();

        let UploadRun::Completed(stats) = uploader.upload().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(stats.blobs_discarded, 1);
        assert_eq!(stats.blobs_delivered, 0);

        let db = open_db(&dir);
        let account = db.ensure_account(&key).unwrap();
        let queue = db.queue_stats(account.id).unwrap();
        assert_eq!(queue.open_blobs, 0);
        assert_eq!(queue.claimed_events, 0);
    }

    #[tokio::test]
    async fn test_upload_with_empty_queue_is_noop() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();

        let transport = ScriptedTransport::new(vec![]);
        let uploader =
            Uploader::with_transport(open_db(&dir), &key, &zero_window(), transport).unwrap();

        let UploadRun::Completed(stats) = uploader.upload().await.unwrap() else {
            panic!("expected completed run");
        };
        assert_eq!(stats, UploadStats::default());
        assert_eq!(uploader.transport.delivery_count(), 0);
    }

    /// Blocks its first delivery until released, so tests can observe the
    /// in-flight window.
    struct BlockingTransport {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        deliveries: StdMutex<usize>,
    }

    impl BlockingTransport {
        fn new() -> Self {
            Self {
                started: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                deliveries: StdMutex::new(0),
            }
        }
    }

    impl BlobTransport for BlockingTransport {
        async fn deliver(&self, _api_key: &str, _payload: Vec<u8>) -> Result<UploadOutcome> {
            let first = {
                let mut count = self.deliveries.lock().unwrap();
                *count += 1;
                *count == 1
            };
            if first {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(UploadOutcome::Accepted { status: 200 })
        }
    }

    #[tokio::test]
    async fn test_concurrent_upload_is_coalesced_not_parallel() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();
        seed_closed_session(&dir, &key);

        let uploader = Arc::new(
            Uploader::with_transport(
                open_db(&dir),
                &key,
                &zero_window(),
                BlockingTransport::new(),
            )
            .unwrap(),
        );

        let active = Arc::clone(&uploader);
        let task = tokio::spawn(async move { active.upload().await });

        // Wait until the first delivery is in flight
        uploader.transport.started.notified().await;

        // A concurrent request must coalesce, not start a second delivery
        assert_eq!(uploader.upload().await.unwrap(), UploadRun::Coalesced);
        assert_eq!(*uploader.transport.deliveries.lock().unwrap(), 1);

        // Events recorded while the upload is blocked are picked up by the
        // rerun pass the coalesced request scheduled
        {
            let db = open_db(&dir);
            let tracker = SessionTracker::new(db, &key, &zero_window()).unwrap();
            tracker.open_session().unwrap();
            tracker.close_session().unwrap();
        }

        uploader.transport.release.notify_one();
        let run = task.await.unwrap().unwrap();

        let UploadRun::Completed(stats) = run else {
            panic!("expected completed run");
        };
        assert_eq!(stats.blobs_delivered, 2);

        let db = open_db(&dir);
        let account = db.ensure_account(&key).unwrap();
        assert_eq!(db.queue_stats(account.id).unwrap().unclaimed_events, 0);
    }

    #[tokio::test]
    async fn test_flight_guard_is_shared_across_uploaders() {
        let dir = TempDir::new().unwrap();
        let key = unique_key();
        seed_closed_session(&dir, &key);

        let first = Arc::new(
            Uploader::with_transport(
                open_db(&dir),
                &key,
                &zero_window(),
                BlockingTransport::new(),
            )
            .unwrap(),
        );
        let second =
            Uploader::with_transport(open_db(&dir), &key, &zero_window(), ScriptedTransport::new(vec![]))
                .unwrap();

        let active = Arc::clone(&first);
        let task = tokio::spawn(async move { active.upload().await });
        first.transport.started.notified().await;

        // A different uploader instance for the same key still coalesces
        assert_eq!(second.upload().await.unwrap(), UploadRun::Coalesced);
        assert_eq!(second.transport.delivery_count(), 0);

        first.transport.release.notify_one();
        task.await.unwrap().unwrap();
    }
}
