//! In-memory asset server for testing.

use crate::api::{ByteStream, FileSize, TransferApi, UploadAuthorization};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use url::Url;
use uuid::Uuid;

/// Size of the chunks streamed bodies are split into.
const CHUNK: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call made against [`MockTransferApi`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferCall {
    Sizes(Vec<String>),
    Enqueue { origin: String, hashes: Vec<String> },
    Request { origin: String, hash: String },
    QueueStatus(Uuid),
    Stream(Uuid),
    Cancel(Uuid),
    UploadAuthorize(Vec<String>),
    Upload(String),
}

/// How the stream of one file misbehaves.
#[derive(Clone, Debug)]
enum Fault {
    /// Deliver the first chunk, then fail with this error.
    Fail(ErrorKind),
    /// Deliver the first chunk, then never finish.
    Stall,
}

#[derive(Clone, Debug)]
struct MockFile {
    data: Vec<u8>,
    origin: Option<Url>,
    forbidden: bool,
    /// Queue status polls answered with "not ready" before the file is.
    ready_after: u32,
    faults: VecDeque<Fault>,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, MockFile>,
    tickets: HashMap<Uuid, (String, u32)>,
    upload_forbidden: BTreeSet<String>,
    uploads: BTreeMap<String, Bytes>,
    cancel_failures: u32,
    calls: Vec<TransferCall>,
}

/// Asset server holding files in memory and serving them LZ4-framed.
///
/// Every call is recorded and can be inspected through
/// [`calls`](Self::calls).
pub struct MockTransferApi {
    base: Url,
    state: Mutex<State>,
}

impl Default for MockTransferApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransferApi {
    pub fn new() -> Self {
        let Ok(base) = Url::parse("http://assets.mock.invalid/") else {
            panic!("MockTransferApi: invalid base url");
        };
        Self { base, state: Mutex::new(State::default()) }
    }

    /// Serve `data` from the default origin; returns its hash.
    pub fn add_file(&self, data: &[u8]) -> String {
        self.insert(data, None)
    }

    /// Serve `data` from another origin; returns its hash.
    pub fn add_file_at(&self, origin: &str, data: &[u8]) -> String {
        let Ok(origin) = Url::parse(origin) else {
            panic!("MockTransferApi::add_file_at: invalid origin {origin}");
        };
        self.insert(data, Some(origin))
    }

    fn insert(&self, data: &[u8], origin: Option<Url>) -> String {
        let hash = veneer_cache::hash_bytes(data);
        let file = MockFile { data: data.to_vec(), origin, forbidden: false, ready_after: 0, faults: VecDeque::new() };
        lock(&self.state).files.insert(hash.clone(), file);
        hash
    }

    /// Report `hash` as forbidden for download.
    pub fn forbid(&self, hash: &str) {
        let mut state = lock(&self.state);
        let file = state.files.entry(hash.to_string()).or_insert_with(|| MockFile {
            data: Vec::new(),
            origin: None,
            forbidden: true,
            ready_after: 0,
            faults: VecDeque::new(),
        });
        file.forbidden = true;
    }

    pub fn forbid_upload(&self, hash: &str) {
        lock(&self.state).upload_forbidden.insert(hash.to_string());
    }

    pub fn set_ready_after(&self, hash: &str, polls: u32) {
        self.with_file(hash, |file| file.ready_after = polls);
    }

    /// The next `times` streams of `hash` fail after their first chunk.
    pub fn fail_stream(&self, hash: &str, times: usize, kind: ErrorKind) {
        self.with_file(hash, |file| file.faults.extend(std::iter::repeat_n(Fault::Fail(kind), times)));
    }

    /// The next stream of `hash` delivers one chunk and then hangs.
    pub fn stall_stream(&self, hash: &str) {
        self.with_file(hash, |file| file.faults.push_back(Fault::Stall));
    }

    pub fn fail_cancels(&self, times: u32) {
        lock(&self.state).cancel_failures = times;
    }

    fn with_file(&self, hash: &str, change: impl FnOnce(&mut MockFile)) {
        let mut state = lock(&self.state);
        let Some(file) = state.files.get_mut(hash) else {
            panic!("MockTransferApi: unknown file {hash}");
        };
        change(file);
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        lock(&self.state).calls.clone()
    }

    /// Hashes a download ticket was requested for, in order.
    pub fn requested(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransferCall::Request { hash, .. } => Some(hash),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransferCall::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Bodies received through [`TransferApi::upload`], still LZ4-framed.
    pub fn uploads(&self) -> BTreeMap<String, Bytes> {
        lock(&self.state).uploads.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    fn record(&self, call: TransferCall) -> MutexGuard<'_, State> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl TransferApi for MockTransferApi {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn sizes(&self, hashes: &[String]) -> Result<Vec<FileSize>> {
        let state = self.record(TransferCall::Sizes(hashes.to_vec()));
        Ok(hashes
            .iter()
            .filter_map(|hash| {
                let file = state.files.get(hash)?;
                Some(FileSize {
                    hash: hash.clone(),
                    size: file.data.len() as u64,
                    forbidden: file.forbidden,
                    url: file.origin.clone(),
                })
            })
            .collect())
    }

    async fn enqueue(&self, origin: &Url, hashes: &[String]) -> Result<()> {
        self.record(TransferCall::Enqueue { origin: origin.to_string(), hashes: hashes.to_vec() });
        Ok(())
    }

    async fn request(&self, origin: &Url, hash: &str) -> Result<Uuid> {
        let mut state = self.record(TransferCall::Request { origin: origin.to_string(), hash: hash.to_string() });
        let ready_after = match state.files.get(hash) {
            Some(file) if !file.forbidden => file.ready_after,
            _ => exn::bail!(ErrorKind::NotFound(hash.to_string())),
        };
        let id = Uuid::new_v4();
        state.tickets.insert(id, (hash.to_string(), ready_after));
        Ok(id)
    }

    async fn queue_status(&self, _origin: &Url, request: Uuid) -> Result<bool> {
        let mut state = self.record(TransferCall::QueueStatus(request));
        let Some((_, remaining)) = state.tickets.get_mut(&request) else {
            exn::bail!(ErrorKind::NotFound(request.to_string()));
        };
        if *remaining == 0 {
            return Ok(true);
        }
        *remaining -= 1;
        Ok(false)
    }

    async fn stream(&self, _origin: &Url, request: Uuid) -> Result<ByteStream> {
        let mut state = self.record(TransferCall::Stream(request));
        let Some((hash, _)) = state.tickets.get(&request).cloned() else {
            exn::bail!(ErrorKind::NotFound(request.to_string()));
        };
        let Some(file) = state.files.get_mut(&hash) else {
            exn::bail!(ErrorKind::NotFound(hash));
        };
        let Ok(compressed) = veneer_compress::compress(&file.data) else {
            exn::bail!(ErrorKind::Compression);
        };
        let mut chunks: Vec<Bytes> = compressed.chunks(CHUNK).map(Bytes::copy_from_slice).collect();
        let stream = match file.faults.pop_front() {
            None => futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            Some(fault) => {
                chunks.truncate(1);
                let head = futures::stream::iter(chunks.into_iter().map(Ok));
                match fault {
                    Fault::Fail(kind) => head.chain(futures::stream::once(async move { Err(exn::Exn::from(kind)) })).boxed(),
                    Fault::Stall => head.chain(futures::stream::pending()).boxed(),
                }
            },
        };
        Ok(stream)
    }

    async fn cancel(&self, _origin: &Url, request: Uuid) -> Result<()> {
        let mut state = self.record(TransferCall::Cancel(request));
        if state.cancel_failures > 0 {
            state.cancel_failures -= 1;
            exn::bail!(ErrorKind::Status(503));
        }
        state.tickets.remove(&request);
        Ok(())
    }

    async fn upload_authorize(&self, hashes: &[String]) -> Result<Vec<UploadAuthorization>> {
        let state = self.record(TransferCall::UploadAuthorize(hashes.to_vec()));
        Ok(hashes
            .iter()
            .map(|hash| UploadAuthorization { hash: hash.clone(), forbidden: state.upload_forbidden.contains(hash) })
            .collect())
    }

    async fn upload(&self, hash: &str, body: Bytes) -> Result<()> {
        let mut state = self.record(TransferCall::Upload(hash.to_string()));
        if state.upload_forbidden.contains(hash) {
            exn::bail!(ErrorKind::Unauthorized);
        }
        state.uploads.insert(hash.to_string(), body);
        Ok(())
    }
}
