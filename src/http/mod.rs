//! HTTP/1.x request parsing and static response building.

mod request;
mod response;

pub use request::{parse_urlencoded, HttpRequest, ParseState};
pub use response::{content_type, HttpResponse};
