pub mod decorator;
pub mod manager;
pub mod redirector;
pub mod rewriter;
pub mod route_map;

pub use decorator::{Decorator, PeerInfo};
pub use manager::RouteManager;
pub use rewriter::Rewriter;
pub use route_map::RouteMap;
