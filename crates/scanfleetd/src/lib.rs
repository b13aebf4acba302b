//! scanfleetd — the scan engine fleet daemon.
//!
//! Wires a validated `fleet.toml` into an engine pool, a fleet manager and
//! a queue monitor, and supervises the two loops.

pub mod fleet;
pub mod supervisor;

pub use fleet::SimulatedFleet;
pub use supervisor::ServiceSupervisor;
