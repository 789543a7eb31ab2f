//! Collaborator traits and their reference implementations.
//!
//! The traits define the interface boundary with the live tree, the outage
//! store, the inventory, the filter service and the notification bus.

mod memory;
mod traits;
mod url;

pub use memory::{
    InMemoryInventory, InMemoryLiveTree, InMemoryOutageStore, LiveTreeConfig, OutageRecord,
    RecordingEventSender, StaticFilterService, TreeOp,
};
pub use traits::{
    EventSender, FilterService, IncludeUrlResolver, InventoryQuery, KeyState, LiveTree,
    OutageStore, ScheduleRequest, StorageError, TrackedNode,
};
pub use url::{parse_ip_list, FileIpListResolver};
