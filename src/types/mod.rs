pub mod leaderboard;
pub mod price;
pub mod trading;
pub mod ws;

pub use leaderboard::*;
pub use price::*;
pub use trading::*;
pub use ws::*;
