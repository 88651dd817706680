//! Managed requests: cache lookup, retry with fixed delay, observable state.
//!
//! A `ManagedRequestExecutor` hands out `RequestHandle`s. Each handle owns
//! one request function, its options and a `RequestState` record that
//! subscribers can watch. Handles share the executor's `RequestCache` and
//! in-flight registry.

pub mod error;
pub mod executor;
pub mod state;

pub use error::RequestError;
pub use executor::{ManagedRequestExecutor, RequestFn, RequestHandle};
pub use state::{ErrorCallback, RequestOptions, RequestState, SuccessCallback};
