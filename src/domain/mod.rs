pub mod bid;
pub mod buyer;
pub mod lead;
pub mod transaction;

pub use bid::*;
pub use buyer::*;
pub use lead::*;
pub use transaction::*;
