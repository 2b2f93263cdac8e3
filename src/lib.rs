pub mod error;
pub mod config;
pub mod traits;
pub mod clock;
pub mod protocol;
pub mod trigger;
pub mod link;
pub mod timers;
pub mod stats;
pub mod session;
pub mod runner;
pub mod input;
pub mod output;
pub mod sink;
pub mod sim;
