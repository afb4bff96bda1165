#![forbid(unsafe_code)]

mod chat;
mod client;

pub use chat::{KickChatConfig, KickChatProtocol};
pub use client::KickClient;
