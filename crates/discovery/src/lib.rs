//! Worker Discovery
//!
//! Workers register themselves under a shared namespace of a coordination
//! store as keys with a lease and keep the lease alive with periodic
//! refreshes. A master loads that namespace, follows its change stream and
//! answers membership queries from its own in-memory view.
//!
//! ```no_run
//! use discovery::{DiscoveryConfig, Master, Worker};
//! use std::sync::Arc;
//!
//! # async fn example() -> discovery::Result<()> {
//! let config = DiscoveryConfig::default();
//!
//! let master = Arc::new(Master::new(config.clone()).await?);
//! let runner = Arc::clone(&master);
//! tokio::spawn(async move { runner.run().await });
//!
//! let worker = Arc::new(Worker::new("client1", "10.0.0.1:9000", config).await?);
//! let registrant = Arc::clone(&worker);
//! tokio::spawn(async move { registrant.register().await });
//!
//! if let Some(member) = master.find_by_name("client1").await {
//!     println!("{}", member);
//! }
//! worker.unregister().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod master;
pub mod member;
pub mod store;
pub mod worker;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, Result};
pub use master::{Master, MembershipChange};
pub use member::{Member, WorkerInfo};
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
pub use worker::{HeartbeatOutcome, Worker, WorkerState};
