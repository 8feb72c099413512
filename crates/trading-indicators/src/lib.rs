//! Rolling-window indicators and per-instrument state.
//!
//! - [`RollingMax`] / [`RollingMin`]: O(1) amortized window extrema
//! - [`InstrumentState`]: fixed-capacity bar window feeding strategies

pub mod rolling;
pub mod state;

pub use rolling::{RollingMax, RollingMin};
pub use state::InstrumentState;
