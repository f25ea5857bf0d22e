//! Built-in example handlers.

mod erc20;

pub use erc20::Erc20Projector;
