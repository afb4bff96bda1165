#![forbid(unsafe_code)]

pub mod accumulator;
pub mod broadcaster;
pub mod correlation;
pub mod event_log;
pub mod health;
pub mod http;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;



#[cfg(test)]
mod http_tests;
