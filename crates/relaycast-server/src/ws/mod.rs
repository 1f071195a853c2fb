pub mod connections;
pub mod dispatch;
pub mod handler;

pub use handler::ws_handler;
