//! scanfleet-pool — the authoritative registry of scan engines.
//!
//! Every engine slot the fleet may ever run is created up front from the
//! pool specification, so the pool size per tier is a hard ceiling. The
//! pool is shared by the queue monitor and the fleet manager; all
//! mutations go through a single write lock.
//!
//! # Architecture
//!
//! ```text
//! EnginePool
//!   ├── SizeClassifier (tier lookup by scan size)
//!   ├── RwLock<arena>
//!   │   ├── Vec<Engine>            (slot order is allocation order)
//!   │   └── HashMap<name, slot>
//!   └── Notify (wakes the fleet manager on provisioning requests)
//! ```
//!
//! # Engine lifecycle
//!
//! ```text
//! UNPROVISIONED → PENDING → STARTING → IDLE ⇄ SCANNING
//!       ↑                                ↓
//!       └────────────────────────── EXPIRING
//! ```
//!
//! Any state other than UNPROVISIONED can fall back to UNPROVISIONED via
//! `on_stop` (launch failure, termination).

pub mod engine;
pub mod error;
pub mod pool;
pub mod snapshot;

pub use engine::{Engine, EngineOp, EngineState, EngineStats};
pub use error::{PoolError, PoolResult};
pub use pool::{EnginePool, min_idle_shortfall};
pub use snapshot::{PoolSnapshot, TierCounts};
