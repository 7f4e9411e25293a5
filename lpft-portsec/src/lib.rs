//! Port-security ingress/egress rule generator (§4.9).

pub mod generator;
pub mod model;

pub use generator::generate;
pub use model::{PortSecEntry, PortSecPort};
