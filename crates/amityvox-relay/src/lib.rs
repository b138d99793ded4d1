pub mod bandwidth;
pub mod e2ee;
pub mod federation;
pub mod p2p;
pub mod participant;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod speaker;
