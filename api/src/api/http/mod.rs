pub mod instances;
pub mod metrics;
pub mod routes;

pub use routes::*;
