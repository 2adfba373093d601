//! Core value types shared across the connection layer.

mod reply;

pub use reply::{Reply, ReplyCode};
