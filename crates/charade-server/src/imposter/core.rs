//! Runtime state of a single imposter.

use super::types::{ImposterConfig, ProxyMode, Stub};
use crate::behaviors::ResponseCursor;
use crate::model::NeutralRequest;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A stub plus the per-stub runtime state: the response cursor and the
/// copy-behavior match iterators. Replacing the stub list discards this
/// state, which is what resets cursors.
#[derive(Debug, Default)]
pub struct StubRuntime {
    pub def: Stub,
    pub cursor: ResponseCursor,
    pub copy_cursors: HashMap<String, usize>,
}

impl StubRuntime {
    pub fn new(def: Stub) -> Self {
        StubRuntime {
            def,
            ..Default::default()
        }
    }
}

/// Everything the imposter's single readers-writer lock protects: the stub
/// list, cursors, the request log and the scripting state.
#[derive(Debug, Default)]
pub struct ImposterState {
    pub stubs: Vec<StubRuntime>,
    pub requests: Vec<NeutralRequest>,
    pub script_state: Value,
}

/// What happened when a proxy-recorded stub was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedStub {
    Inserted(usize),
    Merged(usize),
    Skipped,
}

/// A running imposter: immutable configuration plus locked runtime state.
#[derive(Debug)]
pub struct Imposter {
    pub config: ImposterConfig,
    pub state: RwLock<ImposterState>,
    request_count: AtomicU64,
    pub created_at: String,
    /// SHA-256 fingerprint of the served certificate, set by the HTTPS
    /// server at startup.
    pub cert_fingerprint: OnceCell<String>,
}

impl Imposter {
    pub fn new(config: ImposterConfig) -> Self {
        let stubs = config.stubs.iter().cloned().map(StubRuntime::new).collect();
        Imposter {
            config,
            state: RwLock::new(ImposterState {
                stubs,
                requests: Vec::new(),
                script_state: Value::Object(serde_json::Map::new()),
            }),
            request_count: AtomicU64::new(0),
            created_at: chrono::Utc::now().to_rfc3339(),
            cert_fingerprint: OnceCell::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port.unwrap_or(0)
    }

    /// Count one accepted request. Exactly once per request, whether or not
    /// the request is recorded.
    pub fn accepted(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn record_request(&self, request: NeutralRequest) {
        if self.config.record_requests {
            self.state.write().requests.push(request);
        }
    }

    pub fn requests(&self) -> Vec<NeutralRequest> {
        self.state.read().requests.clone()
    }

    /// Clear the request log and reset the counter.
    pub fn clear_requests(&self) {
        self.state.write().requests.clear();
        self.request_count.store(0, Ordering::SeqCst);
    }

    pub fn stubs(&self) -> Vec<Stub> {
        self.state.read().stubs.iter().map(|s| s.def.clone()).collect()
    }

    pub fn stub(&self, index: usize) -> Option<Stub> {
        self.state.read().stubs.get(index).map(|s| s.def.clone())
    }

    /// Replace the whole stub list; all cursors reset.
    pub fn replace_stubs(&self, stubs: Vec<Stub>) {
        let mut state = self.state.write();
        state.stubs = stubs.into_iter().map(StubRuntime::new).collect();
    }

    /// Insert a stub; `None` appends. Other stubs keep their cursors.
    pub fn add_stub(&self, stub: Stub, index: Option<usize>) {
        let mut state = self.state.write();
        let index = index.unwrap_or(state.stubs.len()).min(state.stubs.len());
        state.stubs.insert(index, StubRuntime::new(stub));
    }

    pub fn replace_stub(&self, index: usize, stub: Stub) -> Result<(), usize> {
        let mut state = self.state.write();
        if index >= state.stubs.len() {
            return Err(index);
        }
        state.stubs[index] = StubRuntime::new(stub);
        Ok(())
    }

    pub fn delete_stub(&self, index: usize) -> Result<(), usize> {
        let mut state = self.state.write();
        if index >= state.stubs.len() {
            return Err(index);
        }
        state.stubs.remove(index);
        Ok(())
    }

    /// Advance a stub's response cursor after an emission.
    pub fn advance_cursor(&self, stub_index: usize, repeat: u32) {
        let mut state = self.state.write();
        if let Some(runtime) = state.stubs.get_mut(stub_index) {
            let count = runtime.def.responses.len();
            runtime.cursor.advance(repeat, count);
        }
    }

    /// Store a proxy-recorded stub.
    ///
    /// proxyOnce inserts before the proxy stub so replays short-circuit;
    /// proxyAlways keeps the proxy matching first, appending the response to
    /// an existing recorded stub with an equal predicate set (so replays
    /// cycle), or inserting a fresh one right after the proxy stub.
    pub fn record_proxy_stub(
        &self,
        stub: Stub,
        proxy_index: usize,
        mode: ProxyMode,
    ) -> RecordedStub {
        match mode {
            ProxyMode::ProxyTransparent => RecordedStub::Skipped,
            ProxyMode::ProxyOnce => {
                let mut state = self.state.write();
                let index = proxy_index.min(state.stubs.len());
                state.stubs.insert(index, StubRuntime::new(stub));
                debug!(port = self.port(), index, "recorded proxyOnce stub");
                RecordedStub::Inserted(index)
            }
            ProxyMode::ProxyAlways => {
                let mut state = self.state.write();
                let new_predicates = serde_json::to_string(&stub.predicates).unwrap_or_default();
                let merge_target = state
                    .stubs
                    .iter()
                    .enumerate()
                    .skip(proxy_index + 1)
                    .find(|(_, existing)| {
                        !existing.def.predicates.is_empty()
                            && serde_json::to_string(&existing.def.predicates).unwrap_or_default()
                                == new_predicates
                    })
                    .map(|(index, _)| index);

                if let Some(index) = merge_target {
                    state.stubs[index].def.responses.extend(stub.responses);
                    debug!(port = self.port(), index, "merged proxyAlways response");
                    RecordedStub::Merged(index)
                } else {
                    let index = (proxy_index + 1).min(state.stubs.len());
                    state.stubs.insert(index, StubRuntime::new(stub));
                    debug!(port = self.port(), index, "recorded proxyAlways stub");
                    RecordedStub::Inserted(index)
                }
            }
        }
    }
}
