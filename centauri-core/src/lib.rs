pub mod config;
pub mod domain;
pub mod error;
pub mod route;

pub use config::RouteSet;
pub use domain::is_domain_name;
pub use error::CentauriError;
pub use route::Route;
