mod context;
mod percent;
mod request;
mod response;
mod server;
mod tables;

pub use context::{HttpContext, MAX_LINE_SIZE, ParseState};
pub use request::{HttpRequest, Method};
pub use response::HttpResponse;
pub use server::{Handler, HttpServer};
pub use tables::{mime_for_ext, status_reason};
