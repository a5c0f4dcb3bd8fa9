//! DDS agent library
//!
//! Agent-side runtime of the DDS (Dynamic Deployment System):
//! - Frame codec and TCP channel to the commander
//! - Protocol handler for the commander's commands
//! - Watchdog over started user tasks
//! - Connection manager tying it together

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod logs;
pub mod manager;
pub mod session;
pub mod transport;
pub mod watchdog;
