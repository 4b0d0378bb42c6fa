//! # Handlers
//!
//! Type-erased async route handlers.
//!
//! Any `async fn(Request) -> Result<R>` is a handler, as is
//! `async fn(Request, D) -> Result<R>` where `D` is resolved from the
//! service container through [`Inject`]. `R` is anything that implements
//! [`IntoResponse`].

use crate::container::{Container, Inject};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::IntoResponse;
use crate::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler function type (async)
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Conversion of functions into [`Handler`]s
///
/// `Args` only disambiguates the implementations for different arities.
pub trait IntoHandler<Args> {
    /// Erase the function into a shared handler
    fn into_handler(self) -> Handler;
}

impl<F, Fut, R> IntoHandler<(Request,)> for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: IntoResponse,
{
    fn into_handler(self) -> Handler {
        Arc::new(move |req: Request| -> BoxFuture<'static, Result<Response>> {
            let fut = self(req);
            Box::pin(async move { fut.await.map(IntoResponse::into_response) })
        })
    }
}

impl<F, Fut, R, D> IntoHandler<(Request, D)> for F
where
    F: Fn(Request, D) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: IntoResponse,
    D: Inject,
{
    fn into_handler(self) -> Handler {
        Arc::new(move |req: Request| -> BoxFuture<'static, Result<Response>> {
            let dependency = resolve::<D>(req.container());
            let fut = dependency.map(|dep| self(req, dep));
            Box::pin(async move { fut?.await.map(IntoResponse::into_response) })
        })
    }
}

fn resolve<D: Inject>(container: Option<&Arc<Container>>) -> Result<D> {
    match container {
        Some(container) => D::inject(container),
        None => Err(Error::Unresolvable {
            type_name: std::any::type_name::<D>(),
        }),
    }
}
