#![allow(dead_code)]

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use resilience_runtime::clock::ManualClock;
use resilience_runtime::events::InMemoryEventPublisher;
use resilience_runtime::executor::ResilienceExecutor;
use resilience_runtime::metrics::InMemoryMetricsRecorder;
use resilience_runtime::repository::{
    CacheConfig, CachedPolicyRepository, InMemoryPolicyStore, StorePolicyRepository,
};
use resilience_runtime::service::PolicyService;
use resilience_runtime::sleeper::InstantSleeper;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq)]
pub struct TestError(pub &'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for TestError {}

/// Executor with a manual clock, instant retry sleeps and an in-memory recorder.
pub fn test_executor() -> (ResilienceExecutor<TestError>, ManualClock, InMemoryMetricsRecorder) {
    let clock = ManualClock::new();
    let recorder = InMemoryMetricsRecorder::new();
    let executor = ResilienceExecutor::builder()
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(InstantSleeper))
        .metrics(Arc::new(recorder.clone()))
        .build();
    (executor, clock, recorder)
}

pub struct ServiceFixture {
    pub store: InMemoryPolicyStore,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub repository: Arc<CachedPolicyRepository<StorePolicyRepository>>,
    pub service: Arc<PolicyService>,
}

/// Service over a cached repository backed by an in-memory store.
pub fn service_fixture() -> ServiceFixture {
    let store = InMemoryPolicyStore::new();
    let repository = Arc::new(CachedPolicyRepository::new(
        StorePolicyRepository::new(Arc::new(store.clone())),
        CacheConfig::default(),
    ));
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let service = Arc::new(PolicyService::new(repository.clone(), publisher.clone()));
    ServiceFixture { store, publisher, repository, service }
}

/// Shared in-memory sink for captured log output.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

pub struct LogWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { buf: self.buf.clone() }
    }
}
