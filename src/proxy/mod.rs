pub mod context;
pub mod handler;

pub use context::{BoxBody, RequestContext};
pub use handler::handle_proxy;
