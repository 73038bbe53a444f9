//! Domain types and the ports the application layer depends on.

pub mod events;
pub mod ids;
pub mod money;
pub mod movement;
pub mod negotiation;
pub mod ports;
pub mod trip;
