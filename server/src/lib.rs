//! # Hub Server Library
//!
//! This library provides the hub that sits in front of a network of game
//! backends. Players connect to the hub and ask to be sent to a backend; the
//! hub holds them in a priority queue until the backend has room, then hands
//! them the backend's address. Backend agents talk to the same hub to report
//! their occupancy and to take turns restarting.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Players wait in a single queue ordered by rank, then by arrival. Each
//! tick the head-most player whose backend can take them is transferred.
//! Backends close to full keep a few reserved slots for staff.
//!
//! ### Restart Coordination
//! At most one backend restarts at a time. Other backends asking to restart
//! are queued behind it with a retry hint, and a watchdog frees the slot if
//! a restart never reports completion.
//!
//! ### Backend Health
//! Backend agents push status reports. A backend that stops reporting is
//! marked offline after a configurable number of missed reports; players
//! waiting for it stay queued.
//!
//! ## Module Organization
//!
//! ### Ledger Module (`ledger`)
//! Binary heap of queue entries with stable back-pointers, so a single
//! entry can be removed without rebuilding the heap.
//!
//! ### Admission Module (`admission`)
//! The admission queue: enqueue, position lookup, reconciliation against
//! backend capacity and re-queueing after a failed transfer.
//!
//! ### Registry Module (`registry`)
//! Configured backends and their last observed status.
//!
//! ### Restart Module (`restart`)
//! The restart coordinator and its sweep.
//!
//! ### Notify Module (`notify`)
//! Player-facing message formatting and the sink trait the queue talks to.
//!
//! ### Client Manager Module (`client_manager`)
//! Connected players, their addresses and timeouts.
//!
//! ### Network Module (`network`)
//! UDP socket handling and the main hub loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::HubConfig;
//! use server::network::{Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HubConfig::load("hub.json")?;
//!     let mut server = Server::new("127.0.0.1:8080", &config, ServerOptions::default()).await?;
//!
//!     // Runs until the process is stopped:
//!     // - Accepts players and queues them for backends
//!     // - Transfers at most one player per tick
//!     // - Answers restart requests from backend agents
//!     // - Ages out backends that stop reporting
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Internal async tasks:
//! - **Network Receiver**: Continuously listens for incoming packets
//! - **Network Sender**: Processes the outgoing packet queue
//! - **Timeout Checker**: Removes players that stopped sending packets
//! - **Restart Watchdog**: Sweeps stale restart requests and stuck restarts
//! - **Main Loop**: Handles packets, reconciles the queue on every tick

pub mod admission;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod ledger;
pub mod network;
pub mod notify;
pub mod registry;
pub mod restart;
