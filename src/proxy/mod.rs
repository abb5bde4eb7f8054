mod body;
pub mod context;
mod handler;

pub use body::{materialize, ReplayableBody};
pub use context::BoxBody;
pub use handler::handle_request;
