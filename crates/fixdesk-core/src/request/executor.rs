use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::cache::{RequestCache, RequestSignature};
use crate::config::RequestDefaults;

use super::{RequestError, RequestOptions, RequestState};

/// A request-producing operation, invoked once per network attempt
pub type RequestFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>, RequestError>>>;

/// Fetches currently on the wire, by signature
#[derive(Default)]
struct InFlight {
    fetches: Mutex<HashMap<RequestSignature, (u64, SharedFetch)>>,
    next_id: AtomicU64,
}

impl InFlight {
    /// Await the in-flight fetch for `signature` when `join` is set and one
    /// exists; otherwise start `start()` and register it for others to join.
    async fn fetch(
        &self,
        signature: &RequestSignature,
        join: bool,
        start: impl FnOnce() -> BoxFuture<'static, Result<Arc<Value>, RequestError>>,
    ) -> Result<Arc<Value>, RequestError> {
        let (id, fetch) = {
            let mut fetches = self.fetches.lock().unwrap_or_else(PoisonError::into_inner);
            let existing = if join { fetches.get(signature).cloned() } else { None };
            match existing {
                Some((id, fetch)) => {
                    debug!(signature = %signature, "Joining in-flight request");
                    (id, fetch)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let fetch = start().shared();
                    fetches.insert(signature.clone(), (id, fetch.clone()));
                    (id, fetch)
                }
            }
        };

        let registration = Registration {
            in_flight: self,
            signature,
            id,
        };
        let result = fetch.await;
        drop(registration);
        result
    }
}

/// Removes a registry entry once nobody awaits it, including when every
/// awaiting task is dropped before the fetch completes.
struct Registration<'a> {
    in_flight: &'a InFlight,
    signature: &'a RequestSignature,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut fetches = self.in_flight.fetches.lock().unwrap_or_else(PoisonError::into_inner);
        // strong_count is None once the fetch completed; 1 means only the registry holds it
        let finished = fetches.get(self.signature).is_some_and(|(current, fetch)| {
            *current == self.id && fetch.strong_count().map_or(true, |count| count <= 1)
        });
        if finished {
            fetches.remove(self.signature);
        }
    }
}

/// Hands out managed request handles that share one cache.
/// Clone is cheap; clones share the cache and the in-flight registry.
#[derive(Clone)]
pub struct ManagedRequestExecutor {
    cache: Arc<RequestCache>,
    in_flight: Arc<InFlight>,
    defaults: RequestDefaults,
}

impl ManagedRequestExecutor {
    pub fn new(cache: Arc<RequestCache>, defaults: RequestDefaults) -> Self {
        Self {
            cache,
            in_flight: Arc::new(InFlight::default()),
            defaults,
        }
    }

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    /// Options seeded from this executor's configured defaults
    pub fn options<T>(&self) -> RequestOptions<T> {
        RequestOptions::from_defaults(&self.defaults)
    }

    /// Create a handle for `request_fn`, identified by `signature`.
    ///
    /// With `options.immediate` the first run is spawned on the current
    /// tokio runtime; otherwise nothing happens until `run` or `trigger`.
    pub fn execute<T, F, Fut>(
        &self,
        signature: impl Into<RequestSignature>,
        request_fn: F,
        options: RequestOptions<T>,
    ) -> RequestHandle<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let request_fn: RequestFn<T> = Arc::new(move || request_fn().boxed());
        let immediate = options.immediate;
        let (state, _) = watch::channel(RequestState::new(options.initial_data.clone()));

        let handle = RequestHandle {
            inner: Arc::new(HandleInner {
                signature: signature.into(),
                request_fn,
                options,
                cache: Arc::clone(&self.cache),
                in_flight: Arc::clone(&self.in_flight),
                state,
                generation: AtomicU64::new(0),
            }),
        };

        if immediate {
            handle.trigger();
        }
        handle
    }
}

/// One managed request and its observable state.
pub struct RequestHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HandleInner<T> {
    signature: RequestSignature,
    request_fn: RequestFn<T>,
    options: RequestOptions<T>,
    cache: Arc<RequestCache>,
    in_flight: Arc<InFlight>,
    state: watch::Sender<RequestState<T>>,
    // Bumped by every run and by cancel; older runs stop writing state
    generation: AtomicU64,
}

impl<T> RequestHandle<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn signature(&self) -> &RequestSignature {
        &self.inner.signature
    }

    /// Snapshot of the current state
    pub fn state(&self) -> RequestState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.inner.state.subscribe()
    }

    /// Run the request to completion: serve a fresh cached value, or fetch
    /// with retries. Supersedes any earlier run of this handle.
    pub async fn run(&self) {
        let generation = self.inner.next_generation();
        self.inner.run(generation, false).await;
    }

    /// Drop the cached value and fetch again from the network
    pub async fn refresh(&self) {
        let generation = self.inner.next_generation();
        self.inner.cache.delete(&self.inner.signature);
        self.inner.run(generation, true).await;
    }

    /// Spawn `run` on the current runtime
    pub fn trigger(&self) -> Option<JoinHandle<()>> {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = self.clone();
                Some(runtime.spawn(async move { handle.run().await }))
            }
            Err(_) => {
                warn!(signature = %self.inner.signature, "No async runtime, request not started");
                None
            }
        }
    }

    /// Abandon any run in progress. Its completion, pending retries and
    /// callbacks are discarded; the in-flight call itself is not aborted.
    pub fn cancel(&self) {
        self.inner.next_generation();
        self.inner.state.send_modify(RequestState::settle);
        debug!(signature = %self.inner.signature, "Request cancelled");
    }
}

impl<T> HandleInner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run(&self, generation: u64, mut bypass_cache: bool) {
        let mut attempt: u32 = 0;

        loop {
            self.state.send_modify(RequestState::begin_loading);

            if !bypass_cache {
                if let Some(data) = self.cached() {
                    debug!(signature = %self.signature, "Serving cached response");
                    self.finish_success(data);
                    return;
                }
            }

            let result = self.fetch(!bypass_cache).await;
            bypass_cache = false;

            if !self.is_current(generation) {
                debug!(signature = %self.signature, "Discarding superseded completion");
                return;
            }

            match result {
                Ok((data, value)) => {
                    self.cache.set(self.signature.clone(), value);
                    self.finish_success(data);
                    return;
                }
                Err(err) if attempt < self.options.retries && err.is_retryable() => {
                    attempt += 1;
                    warn!(
                        signature = %self.signature,
                        attempt,
                        retries = self.options.retries,
                        delay_ms = self.options.retry_delay.as_millis() as u64,
                        error = %err,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                    if !self.is_current(generation) {
                        debug!(signature = %self.signature, "Dropping retry of superseded run");
                        return;
                    }
                }
                Err(err) => {
                    self.finish_error(err.exhausted(attempt + 1));
                    return;
                }
            }
        }
    }

    /// Fresh cached value, if it still decodes into `T`
    fn cached(&self) -> Option<T> {
        let entry = self.cache.get_fresh(&self.signature, self.options.ttl)?;
        match entry.decode() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(signature = %self.signature, error = %e, "Cached value does not match request type, refetching");
                None
            }
        }
    }

    async fn fetch(&self, join_in_flight: bool) -> Result<(T, Arc<Value>), RequestError> {
        if !self.options.dedupe_in_flight {
            let data = (self.request_fn)().await?;
            let value = serde_json::to_value(&data).map_err(RequestError::decode)?;
            return Ok((data, Arc::new(value)));
        }

        let request_fn = Arc::clone(&self.request_fn);
        let value = self
            .in_flight
            .fetch(&self.signature, join_in_flight, move || {
                async move {
                    let data = request_fn().await?;
                    let value = serde_json::to_value(&data).map_err(RequestError::decode)?;
                    Ok(Arc::new(value))
                }
                .boxed()
            })
            .await?;
        let data = T::deserialize(value.as_ref()).map_err(RequestError::decode)?;
        Ok((data, value))
    }

    fn finish_success(&self, data: T) {
        self.state.send_replace(RequestState::succeeded(data.clone()));
        if let Some(on_success) = &self.options.on_success {
            on_success(&data);
        }
    }

    fn finish_error(&self, err: RequestError) {
        warn!(signature = %self.signature, error = %err, "Request failed");
        let keep_data = self.options.keep_data_on_error;
        self.state.send_modify(|state| state.fail(err.clone(), keep_data));
        if let Some(on_error) = &self.options.on_error {
            on_error(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    fn executor() -> ManagedRequestExecutor {
        ManagedRequestExecutor::new(Arc::new(RequestCache::new()), RequestDefaults::default())
    }

    fn deferred<T>(executor: &ManagedRequestExecutor) -> RequestOptions<T> {
        executor.options().immediate(false)
    }

    fn boom() -> ApiError {
        ApiError::Rejected {
            code: 500,
            message: "boom".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_ttl_skips_network() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "repair/list",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                }
            },
            deferred(&executor),
        );

        handle.run().await;
        let key = RequestSignature::new("repair/list");
        assert!(executor.cache().get_fresh(&key, Duration::from_secs(300)).is_some());

        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().data(), Some(&vec![1, 2, 3]));
        assert!(!handle.state().is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_scenario() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "x",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"x": 1}))
                }
            },
            deferred(&executor).ttl(Duration::from_millis(5000)),
        );

        // t=0: miss
        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // t=1000: served from cache
        tokio::time::advance(Duration::from_millis(1000)).await;
        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().data(), Some(&json!({"x": 1})));

        // t=6000: stale, network again
        tokio::time::advance(Duration::from_millis(5000)).await;
        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fetches_once_even_when_fresh() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "counter",
            move || {
                let c = Arc::clone(&c);
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            deferred(&executor),
        );

        handle.run().await;
        assert_eq!(handle.state().data(), Some(&1));

        handle.refresh().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state().data(), Some(&2));

        let entry = executor.cache().get(handle.signature()).expect("cached after refresh");
        assert_eq!(entry.decode::<u32>().expect("decode"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_invokes_retries_plus_one() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "failing",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(boom())
                }
            },
            deferred(&executor).retries(3),
        );

        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let state = handle.state();
        assert!(state.is_error());
        assert!(!state.is_loading());
        assert_eq!(
            state.error(),
            Some(&RequestError::RetryExhausted {
                attempts: 4,
                message: "boom".to_string()
            })
        );
        assert!(executor.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_and_single_error_callback() {
        let executor = executor();
        let delay = Duration::from_millis(1000);
        let attempts_at = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&attempts_at);
        let e = Arc::clone(&errors);
        let handle = executor.execute(
            "boom",
            move || {
                let a = Arc::clone(&a);
                async move {
                    a.lock().unwrap().push(Instant::now());
                    Err::<u32, _>(boom())
                }
            },
            deferred(&executor)
                .retries(2)
                .retry_delay(delay)
                .on_error(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let start = Instant::now();
        handle.run().await;

        let attempts = attempts_at.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= delay * 2);
        assert!(elapsed < delay * 2 + Duration::from_millis(50));

        let state = handle.state();
        assert!(state.is_error());
        assert_eq!(state.error().map(|e| e.message()), Some("boom"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_error_surfaced_between_retries() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "flaky",
            move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(boom())
                    } else {
                        Ok("ok".to_string())
                    }
                }
            },
            deferred(&executor).retry_delay(Duration::from_millis(500)),
        );

        let task = handle.trigger().expect("runtime");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mid = handle.state();
        assert!(mid.is_loading());
        assert!(!mid.is_error());

        task.await.unwrap();
        assert_eq!(handle.state().data().map(String::as_str), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_visible_during_refresh() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "slow",
            move || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(n)
                }
            },
            deferred(&executor),
        );

        handle.run().await;

        let refresher = handle.clone();
        let task = tokio::spawn(async move { refresher.refresh().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mid = handle.state();
        assert!(mid.is_loading());
        assert_eq!(mid.data(), Some(&1));

        task.await.unwrap();
        assert_eq!(handle.state().data(), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_completion_is_discarded() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let s = Arc::clone(&successes);
        let handle = executor.execute(
            "page",
            move || {
                let c = Arc::clone(&c);
                async move {
                    // First call is slow, second is fast
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    let wait = if n == 1 { 200 } else { 10 };
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    Ok(n)
                }
            },
            deferred(&executor).on_success(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let first = handle.trigger().expect("runtime");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = handle.clone();
        let second = tokio::spawn(async move { second.refresh().await });

        second.await.unwrap();
        first.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state().data(), Some(&2));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_result_and_pending_retry() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let e = Arc::clone(&errors);
        let handle = executor.execute(
            "abandoned",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(boom())
                }
            },
            deferred(&executor).on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let task = handle.trigger().expect("runtime");
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        let state = handle.state();
        assert!(!state.is_loading());
        assert!(!state.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_coalesces_concurrent_fetches() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let make = |calls: Arc<AtomicU32>| {
            move || {
                let c = Arc::clone(&calls);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!(["a", "b"]))
                }
            }
        };
        let a = executor.execute(
            "shared",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );
        let b = executor.execute(
            "shared",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );

        let (ta, tb) = (a.trigger().expect("runtime"), b.trigger().expect("runtime"));
        ta.await.unwrap();
        tb.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.state().data(), Some(&json!(["a", "b"])));
        assert_eq!(b.state().data(), Some(&json!(["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_does_not_join_in_flight_fetch() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let make = |calls: Arc<AtomicU32>| {
            move || {
                let c = Arc::clone(&calls);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(n)
                }
            }
        };
        let a = executor.execute(
            "shared",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );
        let b = executor.execute(
            "shared",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );

        let ta = a.trigger().expect("runtime");
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.refresh().await;
        ta.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.state().data(), Some(&1));
        assert_eq!(b.state().data(), Some(&2));
        let entry = executor.cache().get(b.signature()).expect("cached after refresh");
        assert_eq!(entry.decode::<u32>().expect("decode"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_fetch_leaves_no_in_flight_entry() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let make = |calls: Arc<AtomicU32>| {
            move || {
                let c = Arc::clone(&calls);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1u32)
                }
            }
        };
        let a = executor.execute(
            "slow",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );

        let ta = a.trigger().expect("runtime");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.in_flight.fetches.lock().unwrap().len(), 1);

        ta.abort();
        assert!(ta.await.unwrap_err().is_cancelled());
        assert!(executor.in_flight.fetches.lock().unwrap().is_empty());

        // A later fetch starts fresh instead of joining the abandoned one
        let b = executor.execute(
            "slow",
            make(Arc::clone(&calls)),
            deferred(&executor).dedupe_in_flight(true),
        );
        b.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.state().data(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_handles_without_dedupe_each_fetch() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let make = |calls: Arc<AtomicU32>| {
            move || {
                let c = Arc::clone(&calls);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(1u8)
                }
            }
        };
        let a = executor.execute("same", make(Arc::clone(&calls)), deferred(&executor));
        let b = executor.execute("same", make(Arc::clone(&calls)), deferred(&executor));

        let (ta, tb) = (a.trigger().expect("runtime"), b.trigger().expect("runtime"));
        ta.await.unwrap();
        tb.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "private",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(ApiError::Unauthorized)
                }
            },
            deferred(&executor),
        );

        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            handle.state().error(),
            Some(RequestError::SessionExpired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_data_on_error() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "swr",
            move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(7u32)
                    } else {
                        Err(boom())
                    }
                }
            },
            deferred(&executor).retries(0).keep_data_on_error(true),
        );

        handle.run().await;
        handle.refresh().await;
        let state = handle.state();
        assert!(state.is_error());
        assert_eq!(state.data(), Some(&7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_failure_clears_data_by_default() {
        let executor = executor();
        let handle = executor.execute(
            "fails",
            || async { Err::<u32, _>(boom()) },
            deferred(&executor).retries(0).initial_data(3),
        );
        assert_eq!(handle.state().data(), Some(&3));

        handle.run().await;
        assert_eq!(handle.state().data(), None);
        assert!(handle.state().is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_cached_value_is_refetched() {
        let executor = executor();
        executor
            .cache()
            .set(RequestSignature::new("typed"), json!("not a list"));

        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let handle = executor.execute(
            "typed",
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1u8])
                }
            },
            deferred(&executor),
        );

        handle.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().data(), Some(&vec![1u8]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_runs_without_explicit_call() {
        let executor = executor();
        let successes = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&successes);
        let handle = executor.execute(
            "auto",
            || async { Ok("hello".to_string()) },
            executor.options().on_success(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut rx = handle.subscribe();
        let state = rx
            .wait_for(|s| s.data().is_some())
            .await
            .expect("sender alive")
            .clone();
        assert_eq!(state.data().map(String::as_str), Some("hello"));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_without_runtime_defers() {
        let executor = executor();
        let handle = executor.execute("idle", || async { Ok(1u8) }, executor.options());
        assert!(!handle.state().is_loading());
        assert_eq!(handle.state().data(), None);
    }
}
