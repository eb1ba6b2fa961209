pub mod episode;
pub mod lease;
pub mod transaction;

pub use episode::*;
pub use lease::*;
pub use transaction::*;
