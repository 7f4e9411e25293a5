//! Load-balancer hairpin detection and SNAT rule generator (§4.8).

pub mod generator;
pub mod id_pool;
pub mod model;

pub use generator::generate;
pub use id_pool::HairpinIdPool;
pub use model::{Backend, LoadBalancer};
