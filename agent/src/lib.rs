//! # Backend Agent Library
//!
//! Runs next to a game backend and speaks the hub's UDP protocol on its
//! behalf. The agent has two jobs:
//!
//! ### Status Reporting
//! Periodically pushes the backend's player count and capacity to the hub.
//! The hub uses these reports to decide when queued players can be sent to
//! the backend, and marks the backend offline when the reports stop.
//!
//! ### Restart Coordination
//! Before a backend restarts it asks the hub for the restart slot. Only one
//! backend holds the slot at a time; the others are told when to ask again.
//! The agent honours these hints with a little random jitter, runs the
//! restart command once allowed and reports completion so the next backend
//! can go. Crashes and manual restarts can be reported after the fact so
//! the hub still applies its cooldown.
//!
//! ## Module Organization
//!
//! - `network`: request/response link to the hub
//! - `status`: occupancy reporting
//! - `restart`: restart slot negotiation and command execution
//! - `error`: agent error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use agent::network::HubLink;
//! use agent::restart::{RestartAgent, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = HubLink::connect("127.0.0.1:8080").await?;
//!     let mut agent = RestartAgent::new(link, "RED", RetryPolicy::default());
//!
//!     // Blocks until the hub hands over the restart slot
//!     agent.run_restart("systemctl restart red").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod network;
pub mod restart;
pub mod status;
