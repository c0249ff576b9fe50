//! Clustered device mount for netmount.
//!
//! One node of the cluster (the master) holds the live session to a
//! network device; every other node (a slave) presents the same services
//! by forwarding each call to the master.
//!
//! # Architecture
//!
//! Everything is an actor with a bounded mailbox of one closed message
//! enum. Replies travel back on `oneshot` channels.
//!
//! ## Components
//!
//! - **Coordinator**: one per device per node; holds the role and routes
//!   every request
//! - **Proxies**: own a single device transaction or data-tree session on
//!   the master, cancelled after an idle window
//! - **Resolver**: builds the slave's schema model from sources served by
//!   the master, retrying on remote-call timeouts
//! - **Forwarder**: runs RPCs and actions on the master
//! - **Façade**: slave-side services that forward to the master
//!
//! ## Mount Process
//!
//! 1. **Master**: the node holding the session calls
//!    [`MountPointHandle::become_master`]
//! 2. **Discovery**: each other node asks the master with
//!    [`MountPointHandle::ask_for_master_mountpoint`]
//! 3. **Registration**: the master tells the slave its schema sources
//! 4. **Resolution**: the slave fetches each source from the master
//! 5. **Mount**: the slave registers the façade with its mount-point service
//!
//! # Example
//!
//! ```no_run
//! use netmount_cluster::mock::{MockDevice, MockMountPointService};
//! use netmount_cluster::{InMemorySchemaRepository, MountConfig, MountPointHandle};
//! use netmount_types::{DeviceId, SourceId};
//! use std::sync::Arc;
//!
//! # async fn demo() -> netmount_cluster::MountResult<()> {
//! let device = DeviceId::new("router-1", "192.0.2.1:830".parse().unwrap());
//! let repository = InMemorySchemaRepository::new();
//! repository.add_source(SourceId::new("ietf-interfaces"), "module ietf-interfaces {}");
//!
//! let master = MountPointHandle::spawn(
//!     device.clone(),
//!     MountConfig::default(),
//!     Arc::new(repository),
//!     Arc::new(MockMountPointService::new()),
//! )?;
//! master
//!     .become_master(vec![SourceId::new("ietf-interfaces")], MockDevice::new().services())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
mod error;
pub mod facade;
pub mod forwarder;
pub mod mock;
pub mod protocol;
pub mod proxy;
mod resolver;
pub mod schema;
pub mod services;

pub use config::MountConfig;
pub use coordinator::MountPointHandle;
pub use error::{MountError, MountResult};
pub use facade::slave_services;
pub use forwarder::RpcForwarder;
pub use protocol::{MountStatus, RefreshSettings, Reply, Role, RpcOutput};
pub use proxy::{DataTreeRef, ReadTransactionRef, TransactionRef};
pub use resolver::should_log_attempt;
pub use schema::{
    InMemorySchemaRepository, SchemaModel, SchemaRepository, SchemaSource, SchemaSourceProvider,
};
pub use services::{
    ActionService, DataBroker, DataTreeService, DeviceServices, MountPointService,
    ReadTransaction, ReadWriteTransaction, Registration, RpcService, WriteTransaction,
};
