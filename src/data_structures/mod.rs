//! Plain data types shared by the wallet components

pub mod fee_target;
pub mod history;
pub mod script_type;

pub use fee_target::*;
pub use history::*;
pub use script_type::*;
