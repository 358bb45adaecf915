pub mod erc20;

pub use erc20::{transfer_topic, IERC20};
