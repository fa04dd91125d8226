//! The backend application contract.
//!
//! An application receives a [`Request`] (environment plus body stream) and
//! a [`ResponseWriter`]. It calls `start_response` with a status line and
//! headers, then writes body chunks. The core adds `Connection: close` and
//! the request id header and takes care of errors:
//!
//! - `Err(..)` (or a panic) before anything was sent → `500` with a
//!   plain-text body
//! - after the head went out → the connection is aborted

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::http::body::BodyReader;
use crate::http::environ::Environ;
use crate::http::response::{ResponseError, ResponseWriter};

/// Future returned by [`Application::call`].
pub type AppFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

/// Failure inside a backend application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("response error: {0}")]
    Response(#[from] ResponseError),
    #[error("request exceeded {0:?}")]
    Timeout(Duration),
    #[error("application panicked: {0}")]
    Panic(String),
}

impl AppError {
    pub fn msg(message: impl Into<String>) -> Self {
        AppError::Message(message.into())
    }
}

/// Everything an application gets to see about the request.
#[derive(Debug)]
pub struct Request {
    pub environ: Environ,
    pub body: BodyReader,
}

/// A request-handling application.
pub trait Application: Send + Sync + 'static {
    fn call<'a>(&'a self, request: Request, response: &'a mut ResponseWriter) -> AppFuture<'a>;
}

/// A fully buffered response, for applications that do not stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new("200 OK")
    }

    /// A `text/plain` reply.
    pub fn text(status: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain")
            .body(body.into().into_bytes())
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Send the reply, adding `Content-Length` unless the headers have one.
    pub async fn send(self, response: &mut ResponseWriter) -> Result<(), AppError> {
        let mut headers = self.headers;
        if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
            headers.push(("Content-Length".to_string(), self.body.len().to_string()));
        }
        response.start_response(&self.status, headers)?;
        response.write(&self.body).await?;
        Ok(())
    }
}

/// Application built from an async closure; see [`from_fn`].
pub struct FnApp<F>(F);

/// Adapt `|request| async { Ok(Reply) }` into an [`Application`].
pub fn from_fn<F, Fut>(f: F) -> FnApp<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, AppError>> + Send + 'static,
{
    FnApp(f)
}

impl<F, Fut> Application for FnApp<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, AppError>> + Send + 'static,
{
    fn call<'a>(&'a self, request: Request, response: &'a mut ResponseWriter) -> AppFuture<'a> {
        Box::pin(async move {
            let reply = (self.0)(request).await?;
            reply.send(response).await
        })
    }
}
