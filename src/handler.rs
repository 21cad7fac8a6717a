//! Route handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router needs to hold handlers of *different* types in a single
//! `HashMap<Method, Tree>`. Rust collections can only hold one concrete type,
//! so we use **trait objects** (`dyn ErasedHandler`) to hide the concrete
//! handler type behind a common interface and store everything uniformly.
//!
//! ```text
//! async fn get_user(req: Request) -> Response { … }   ← user writes this
//!        ↓ router.on(Method::Get, "/users/{id}", get_user)
//! get_user.into_boxed_handler()                      ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(get_user))                      ← stored as BoxedHandler
//!        ↓
//! handler.call(req)  at request time                 ← one vtable dispatch
//!        ↓
//! Box::pin(async { get_user(req).await.into_outcome() })
//! ```
//!
//! A handler may also return `Result<T, E>`. `Ok` becomes the response;
//! `Err` is propagated out of the router untouched so the layers above it
//! (the metrics middleware, then the server) can observe the failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::StatusCode;

use crate::error::BoxError;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future.
///
/// `Pin<Box<…>>` is required because the runtime polls the future in place;
/// `Send` lets tokio move it across worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response, BoxError>>;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Handler outcome ───────────────────────────────────────────────────────────

/// What a handler may return: anything convertible into a response, or a
/// `Result` whose error is propagated as an application failure.
pub trait IntoOutcome {
    fn into_outcome(self) -> Result<Response, BoxError>;
}

macro_rules! infallible_outcome {
    ($($ty:ty),* $(,)?) => {
        $(impl IntoOutcome for $ty {
            fn into_outcome(self) -> Result<Response, BoxError> {
                Ok(self.into_response())
            }
        })*
    };
}

infallible_outcome!(Response, StatusCode, String, &'static str);

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoResponse,
    E: Into<BoxError>,
{
    fn into_outcome(self) -> Result<Response, BoxError> {
        self.map(IntoResponse::into_response).map_err(Into::into)
    }
}

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any `async fn` with
/// the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoOutcome
/// ```
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype bridging a concrete handler `F` to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Result<Response, BoxError>> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_split_into_response_or_failure() {
        let ok: Result<&'static str, BoxError> = Ok("fine");
        assert_eq!(ok.into_outcome().unwrap().status_code(), 200);

        let err: Result<Response, std::io::Error> =
            Err(std::io::Error::other("database down"));
        assert_eq!(err.into_outcome().unwrap_err().to_string(), "database down");
    }

    #[test]
    fn status_is_an_infallible_outcome() {
        let res = StatusCode::NO_CONTENT.into_outcome().unwrap();
        assert_eq!(res.status_code(), 204);
    }
}
