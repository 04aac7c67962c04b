//! In-memory stand-ins for the queue, the result store, the dead-letter sink,
//! the status list and the detector, sharing one journal so tests can check the order in
//! which effects became visible.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use image::{ImageBuffer, ImageFormat, Rgb};
use sensiflow_image_processor::{
    models::{
        detection::{BoundingBox, Detection},
        frame::{Delivery, DeliveryTag, FrameEnvelope, FrameJob, PayloadRef},
        job::DeadLetterRecord,
        status::FrameStatus,
    },
    pipeline::{DrainReport, PipelineSettings, ProcessingPipeline},
    services::{
        dead_letter::{DeadLetterError, DeadLetterSink},
        detector::{DecodedFrame, Detector, DetectorError, RawDetection},
        inference::InferenceEngine,
        queue::{FrameSource, SourceError},
        result_store::{PersistOutcome, ResultStore, StoreError},
        retry::RetryPolicy,
        status::{StatusError, StatusPublisher},
    },
};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ordered record of externally visible effects.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Commit { job_id: String },
    Conflict { job_id: String },
    Pending { job_id: String, attempt: u32 },
    Failed { job_id: String, attempt: u32 },
    DeadLetter { job_id: String },
    Ack { job_id: String },
    Nack { job_id: String, requeue: bool },
    Status { job_id: String, code: u16 },
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// Encoded 8x6 PNG, enough for the decoder.
pub fn png_frame() -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(8, 6, Rgb([40, 80, 120]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn envelope(job_id: &str, stream_id: &str, sequence_number: i64) -> FrameEnvelope {
    envelope_with(job_id, stream_id, sequence_number, png_frame())
}

pub fn envelope_with(job_id: &str, stream_id: &str, sequence_number: i64, data: Vec<u8>) -> FrameEnvelope {
    FrameEnvelope {
        job_id: job_id.to_string(),
        stream_id: stream_id.to_string(),
        sequence_number,
        payload: PayloadRef::Inline { data },
        enqueued_at: Utc::now(),
    }
}

pub fn raw(label: &str, confidence: f32) -> RawDetection {
    RawDetection {
        class_label: label.to_string(),
        confidence,
        bounding_box: BoundingBox::new(0.1, 0.2, 0.5, 0.6),
    }
}

fn job_id_of(tag: &DeliveryTag) -> String {
    match Delivery::from_raw(tag.as_str().to_string()) {
        Delivery::Frame(job) => job.job_id,
        Delivery::Malformed(m) => m.job_id.unwrap_or_else(|| "malformed".to_string()),
    }
}

fn lost_connection() -> SourceError {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
    SourceError::ConnectionLost(redis::RedisError::from(io))
}

#[derive(Default)]
struct Lists {
    ready: Mutex<VecDeque<String>>,
    processing: Mutex<Vec<String>>,
}

impl Lists {
    /// Atomic move from the head of `ready` into `processing`.
    fn pop(&self) -> Option<String> {
        let raw = self.ready.lock().unwrap().pop_front()?;
        self.processing.lock().unwrap().push(raw.clone());
        Some(raw)
    }
}

/// Queue with a processing list, like the Redis reliable queue.
pub struct MemorySource {
    journal: Journal,
    lists: Arc<Lists>,
    failing_acks: AtomicUsize,
    failing_receives: AtomicUsize,
    server_side_pop: AtomicBool,
}

impl MemorySource {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            lists: Arc::new(Lists::default()),
            failing_acks: AtomicUsize::new(0),
            failing_receives: AtomicUsize::new(0),
            server_side_pop: AtomicBool::new(false),
        }
    }

    pub fn push(&self, envelope: &FrameEnvelope) {
        self.push_raw(envelope.encode().unwrap());
    }

    pub fn push_raw(&self, raw: impl Into<String>) {
        self.lists.ready.lock().unwrap().push_back(raw.into());
    }

    /// Fail the next `n` acks with a lost connection.
    pub fn fail_acks(&self, n: usize) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` receives with a lost connection.
    pub fn fail_receives(&self, n: usize) {
        self.failing_receives.store(n, Ordering::SeqCst);
    }

    pub fn receive_failures_left(&self) -> usize {
        self.failing_receives.load(Ordering::SeqCst)
    }

    /// Run each receive as a blocking pop that keeps waiting for its full
    /// timeout even if the caller stops listening, the way a BLMOVE already
    /// sent to Redis does.
    pub fn pop_server_side(&self) {
        self.server_side_pop.store(true, Ordering::SeqCst);
    }

    pub fn ready_len(&self) -> usize {
        self.lists.ready.lock().unwrap().len()
    }

    pub fn processing_len(&self) -> usize {
        self.lists.processing.lock().unwrap().len()
    }

    fn release(&self, tag: &DeliveryTag) -> bool {
        let mut processing = self.lists.processing.lock().unwrap();
        match processing.iter().position(|raw| raw == tag.as_str()) {
            Some(i) => {
                processing.remove(i);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, SourceError> {
        let failing = self.failing_receives.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_receives.store(failing - 1, Ordering::SeqCst);
            return Err(lost_connection());
        }

        if self.server_side_pop.load(Ordering::SeqCst) {
            let lists = self.lists.clone();
            let pop = tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + wait;
                loop {
                    if let Some(raw) = lists.pop() {
                        return Some(raw);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            });
            return Ok(pop.await.unwrap().map(Delivery::from_raw));
        }

        match self.lists.pop() {
            Some(raw) => Ok(Some(Delivery::from_raw(raw))),
            None => {
                tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), SourceError> {
        let failing = self.failing_acks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_acks.store(failing - 1, Ordering::SeqCst);
            return Err(lost_connection());
        }
        self.release(tag);
        self.journal.push(Event::Ack { job_id: job_id_of(tag) });
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), SourceError> {
        if self.release(tag) && requeue {
            self.lists.ready.lock().unwrap().push_back(tag.as_str().to_string());
        }
        self.journal.push(Event::Nack {
            job_id: job_id_of(tag),
            requeue,
        });
        Ok(())
    }

    async fn fetch_frame(&self, job: &FrameJob) -> Result<Vec<u8>, SourceError> {
        match &job.payload_ref {
            PayloadRef::Inline { data } => Ok(data.clone()),
            PayloadRef::Blob { key } => Err(SourceError::NoBlobStore(key.clone())),
        }
    }

    async fn recover_in_flight(&self) -> Result<usize, SourceError> {
        let stranded: Vec<String> = self.lists.processing.lock().unwrap().drain(..).collect();
        let moved = stranded.len();
        self.lists.ready.lock().unwrap().extend(stranded);
        Ok(moved)
    }
}

/// Result store keyed on `(stream_id, sequence_number)` with the same
/// conflict rule as the `job_status` unique index.
pub struct MemoryStore {
    journal: Journal,
    processed: Mutex<HashMap<(String, i64), Vec<Detection>>>,
    progress: Mutex<HashMap<String, i64>>,
    failures: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            processed: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Fail upcoming persist calls with these errors, in order.
    pub fn fail_persists(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn detections(&self, stream_id: &str, sequence_number: i64) -> Vec<Detection> {
        self.processed
            .lock()
            .unwrap()
            .get(&(stream_id.to_string(), sequence_number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_detections(&self) -> usize {
        self.processed.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn max_sequence(&self, stream_id: &str) -> Option<i64> {
        self.progress.lock().unwrap().get(stream_id).copied()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn persist(&self, job: &FrameJob, _attempt: u32, detections: &[Detection]) -> Result<PersistOutcome, StoreError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let key = (job.stream_id.clone(), job.sequence_number);
        let mut processed = self.processed.lock().unwrap();
        if processed.contains_key(&key) {
            self.journal.push(Event::Conflict { job_id: job.job_id.clone() });
            return Ok(PersistOutcome::Conflict);
        }
        processed.insert(key, detections.to_vec());

        let mut progress = self.progress.lock().unwrap();
        let max = progress.entry(job.stream_id.clone()).or_insert(job.sequence_number);
        *max = (*max).max(job.sequence_number);

        self.journal.push(Event::Commit { job_id: job.job_id.clone() });
        Ok(PersistOutcome::Committed)
    }

    async fn mark_pending(&self, job: &FrameJob, attempt: u32, _reason: &str) -> Result<(), StoreError> {
        self.journal.push(Event::Pending {
            job_id: job.job_id.clone(),
            attempt,
        });
        Ok(())
    }

    async fn mark_failed(&self, job: &FrameJob, attempt: u32, _reason: &str) -> Result<(), StoreError> {
        self.journal.push(Event::Failed {
            job_id: job.job_id.clone(),
            attempt,
        });
        Ok(())
    }
}

pub struct MemoryDeadLetters {
    journal: Journal,
    records: Mutex<Vec<DeadLetterRecord>>,
    failing: AtomicUsize,
}

impl MemoryDeadLetters {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            records: Mutex::new(Vec::new()),
            failing: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, entry: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
            return Err(DeadLetterError::Redis(redis::RedisError::from(io)));
        }
        self.records.lock().unwrap().push(entry.clone());
        self.journal.push(Event::DeadLetter {
            job_id: entry.job_id.clone(),
        });
        Ok(())
    }
}

/// Captures status replies in publish order.
pub struct MemoryStatus {
    journal: Journal,
    published: Mutex<Vec<FrameStatus>>,
}

impl MemoryStatus {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<FrameStatus> {
        self.published.lock().unwrap().clone()
    }

    pub fn for_job(&self, job_id: &str) -> Vec<FrameStatus> {
        self.published().into_iter().filter(|s| s.job_id == job_id).collect()
    }
}

#[async_trait]
impl StatusPublisher for MemoryStatus {
    async fn publish(&self, status: &FrameStatus) -> Result<(), StatusError> {
        self.published.lock().unwrap().push(status.clone());
        self.journal.push(Event::Status {
            job_id: status.job_id.clone(),
            code: status.code,
        });
        Ok(())
    }
}

/// Replays scripted results, then reports nothing detected.
#[derive(Default)]
pub struct ScriptedDetector {
    script: Mutex<VecDeque<Result<Vec<RawDetection>, DetectorError>>>,
}

impl ScriptedDetector {
    pub fn new(script: impl IntoIterator<Item = Result<Vec<RawDetection>, DetectorError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, _frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError> {
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Always fails with the same error.
pub struct FailingDetector(pub fn() -> DetectorError);

#[async_trait]
impl Detector for FailingDetector {
    async fn detect(&self, _frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError> {
        Err((self.0)())
    }
}

/// Never returns, like a wedged accelerator.
pub struct HangingDetector;

#[async_trait]
impl Detector for HangingDetector {
    async fn detect(&self, _frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError> {
        std::future::pending().await
    }
}

/// Tracks how many detections run at once.
#[derive(Default)]
pub struct CountingDetector {
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

#[async_trait]
impl Detector for CountingDetector {
    async fn detect(&self, _frame: &DecodedFrame) -> Result<Vec<RawDetection>, DetectorError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![raw("person", 0.8)])
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 3)
}

pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        receive_timeout: Duration::from_millis(20),
        payload_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_millis(200),
        max_in_flight: 4,
    }
}

/// One worker wired to in-memory adapters.
pub struct Harness {
    pub journal: Journal,
    pub source: Arc<MemorySource>,
    pub store: Arc<MemoryStore>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub status: Arc<MemoryStatus>,
    pub engine: Arc<InferenceEngine>,
}

impl Harness {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self::with_engine(InferenceEngine::new(detector, 2, Duration::from_secs(5)))
    }

    pub fn with_engine(engine: InferenceEngine) -> Self {
        let journal = Journal::default();
        Self {
            source: Arc::new(MemorySource::new(journal.clone())),
            store: Arc::new(MemoryStore::new(journal.clone())),
            dead_letters: Arc::new(MemoryDeadLetters::new(journal.clone())),
            status: Arc::new(MemoryStatus::new(journal.clone())),
            engine: Arc::new(engine),
            journal,
        }
    }

    pub fn pipeline(&self, retry: RetryPolicy, settings: PipelineSettings) -> Arc<ProcessingPipeline> {
        Arc::new(ProcessingPipeline::new(
            self.source.clone(),
            self.engine.clone(),
            self.store.clone(),
            self.dead_letters.clone(),
            self.status.clone(),
            retry,
            settings,
        ))
    }

    pub fn start(&self, retry: RetryPolicy, settings: PipelineSettings) -> Running {
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.pipeline(retry, settings).run(token.clone()));
        Running { token, handle }
    }

    /// Poll the journal until `done` holds, failing the test after 5s.
    pub async fn wait_for(&self, done: impl Fn(&Journal) -> bool) {
        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&self.journal) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "timed out waiting; journal: {:?}", self.journal.events());
    }
}

pub struct Running {
    pub token: CancellationToken,
    handle: JoinHandle<DrainReport>,
}

impl Running {
    pub async fn stop(self) -> DrainReport {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the run to end; cancel `token` first.
    pub async fn join(self) -> DrainReport {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("pipeline did not stop")
            .unwrap()
    }
}
