//! # Replica Engine
//!
//! A replication engine for a shared, reactive object tree.
//!
//! Independent execution contexts (one long-lived coordinator and any number
//! of short-lived clients) share one logical tree. Reads and writes are
//! local and synchronous; changes travel between peers as document updates
//! and merge without a central lock.
//!
//! ## Core Concepts
//!
//! ### Replicated document
//!
//! The [`Doc`] is the replicated state. Map keys are last-writer-wins
//! registers ordered by an [`OpId`] (a Lamport stamp); lists are an RGA
//! sequence. Applying an update twice is a no-op.
//!
//! ### Reactive tree
//!
//! The [`Tree`] is what callers read and write. Every map or list node is
//! paired with a document container; writes made through a [`Txn`] are
//! mirrored into the document, and remote document changes are replayed onto
//! the tree without echoing back.
//!
//! ### Replicas and registries
//!
//! A [`Replica`] is one named tree with its document and transport channel.
//! A [`Registry`] owns the replicas of one `namespace:store` pair and runs
//! their bootstrap, migration, and idle eviction.
//!
//! ### Models
//!
//! Maps tagged with `"__model"` are hydrated with a registered [`Model`]:
//! declared keys, computed values, and attach/detach hooks.
//!
//! ## Quick Start
//!
//! ```rust
//! use replica_engine::{MemoryHub, MemoryStore, Registry, Role};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> replica_engine::Result<()> {
//! let hub = MemoryHub::new();
//! let coordinator = Registry::builder("app", "main")
//!     .role(Role::Coordinator)
//!     .transport(hub.endpoint())
//!     .store(Arc::new(MemoryStore::new()))
//!     .build();
//! let client = Registry::builder("app", "main")
//!     .transport(hub.endpoint())
//!     .build();
//!
//! let cart = client.connect(Some("cart"), Some(json!({"items": []})), None).await?;
//! cart.transaction(|txn| {
//!     let items = txn.node_at(&["items"])?;
//!     txn.push(items, json!({"sku": "X"}))
//! })
//! .await?;
//!
//! let mirrored = coordinator.get(Some("cart")).expect("connected by the client");
//! assert_eq!(mirrored.to_plain()?, json!({"items": [{"sku": "X"}]}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! Coordinators persist a [`DocSnapshot`] per replica through a
//! [`DurableStore`], debounced after every change and once more on
//! disconnect.

pub mod clock;
pub mod config;
pub mod doc;
pub mod error;
pub mod graph;
pub mod lock;
mod mirror;
pub mod model;
mod propagate;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod snapshot;
pub mod storage;
pub mod transport;
pub mod tree;
pub mod txn;
pub mod value;
pub mod versioner;

// Re-export main types at crate root
pub use clock::{LogicalClock, OpId};
pub use config::EngineConfig;
pub use doc::{ContainerId, ContainerKind, Doc, DocEvent, DocValue, Item, Op, Update};
pub use error::{Error, Result};
pub use graph::{Flush, Graph};
pub use model::{tagged, Model, ModelRegistry, MODEL_TAG_KEY};
pub use protocol::{ConnectRequest, ListRequest, NameRequest, ReplicaListing};
pub use registry::{Registry, RegistryBuilder};
pub use replica::{ChangeBatch, Mode, Replica, ReplicaContext, ReplicaId, ReplicaState, Role};
pub use snapshot::{DocSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{DurableStore, MemoryStore};
pub use transport::{handler, Handler, HandlerId, MemoryHub, MemoryTransport, Transport};
pub use tree::{Change, Node, NodeId, Tree};
pub use txn::Txn;
pub use value::{Input, Origin, Value};
pub use versioner::{Versioner, VERSION_KEY};

/// Identifier of the peer owning a document.
pub type PeerId = String;
