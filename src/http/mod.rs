//! HTTP/1.x protocol handling.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept loop, one reader per connection)
//!     → reader.rs (TLS wrap, head parse via head.rs, dispatch)
//!     → [routing layer picks the service]
//!     → environ.rs + body.rs (what the application sees)
//!     → response.rs (status line, headers, body back to the client)
//! ```
//!
//! Every response closes the connection; there is no keep-alive.

pub mod body;
pub mod environ;
pub mod head;
pub mod reader;
pub mod response;
pub mod server;

pub use body::BodyReader;
pub use environ::{parse_query, Environ, QueryDict};
pub use head::{Consumed, Headers, HttpHead};
pub use reader::{ReaderContext, ReaderState, RequestReader};
pub use response::{status_response, ResponseError, ResponseWriter, X_REQUEST_ID};
pub use server::HttpServer;
