//! Order execution and position tracking.
//!
//! The position book is the only record of what the bot owns. Entries and
//! exits go through [`OrderExecutor`], which keeps the book, the store and
//! the broker in step.

mod orders;
mod position;
mod sizing;

pub use orders::{ClosedTrade, EntryOutcome, OrderExecutor};
pub use position::{Position, PositionBook, PositionState};
pub use sizing::{OrderSize, SizeSkip, Sizer};
