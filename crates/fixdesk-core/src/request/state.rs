use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RequestDefaults;

use super::RequestError;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&RequestError) + Send + Sync>;

/// Observable record of one managed request.
/// `is_error()` is true exactly when an error is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestState<T> {
    data: Option<T>,
    error: Option<RequestError>,
    is_loading: bool,
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> RequestState<T> {
    pub fn new(initial_data: Option<T>) -> Self {
        Self {
            data: initial_data,
            error: None,
            is_loading: false,
        }
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Start an attempt; previous data stays visible
    pub(crate) fn begin_loading(&mut self) {
        self.is_loading = true;
        self.error = None;
    }

    pub(crate) fn succeeded(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            is_loading: false,
        }
    }

    pub(crate) fn fail(&mut self, error: RequestError, keep_data: bool) {
        if !keep_data {
            self.data = None;
        }
        self.error = Some(error);
        self.is_loading = false;
    }

    pub(crate) fn settle(&mut self) {
        self.is_loading = false;
    }
}

/// Per-request behaviour. Built from the executor's defaults with
/// `ManagedRequestExecutor::options` and adjusted with the builder methods.
pub struct RequestOptions<T> {
    /// Start the first run as soon as the handle is created
    pub immediate: bool,
    pub initial_data: Option<T>,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    pub ttl: Duration,
    /// Share one network call between concurrent fetches of a signature
    pub dedupe_in_flight: bool,
    /// Keep the last data when the final attempt fails
    pub keep_data_on_error: bool,
    pub(crate) on_success: Option<SuccessCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl<T> Default for RequestOptions<T> {
    fn default() -> Self {
        Self::from_defaults(&RequestDefaults::default())
    }
}

impl<T> Clone for RequestOptions<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            immediate: self.immediate,
            initial_data: self.initial_data.clone(),
            retries: self.retries,
            retry_delay: self.retry_delay,
            ttl: self.ttl,
            dedupe_in_flight: self.dedupe_in_flight,
            keep_data_on_error: self.keep_data_on_error,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for RequestOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("immediate", &self.immediate)
            .field("has_initial_data", &self.initial_data.is_some())
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("ttl", &self.ttl)
            .field("dedupe_in_flight", &self.dedupe_in_flight)
            .field("keep_data_on_error", &self.keep_data_on_error)
            .finish_non_exhaustive()
    }
}

impl<T> RequestOptions<T> {
    pub fn from_defaults(defaults: &RequestDefaults) -> Self {
        Self {
            immediate: true,
            initial_data: None,
            retries: defaults.retries,
            retry_delay: defaults.retry_delay(),
            ttl: defaults.ttl(),
            dedupe_in_flight: false,
            keep_data_on_error: false,
            on_success: None,
            on_error: None,
        }
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn dedupe_in_flight(mut self, dedupe: bool) -> Self {
        self.dedupe_in_flight = dedupe;
        self
    }

    pub fn keep_data_on_error(mut self, keep: bool) -> Self {
        self.keep_data_on_error = keep;
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&RequestError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}
