pub mod client;
pub mod framing;
pub mod requests;
pub mod socket;
pub mod trace;
pub mod transport;
pub mod transport_trait;
pub mod types;
