pub mod bitmap;
pub mod buffer;
pub mod error;
pub mod lifetime;
pub mod scheduler;
pub mod thread;

pub mod prelude {
    pub use crate::buffer::alloc::BufferAllocator;
    pub use crate::buffer::managed_ptr::BufferManagedPtr;
    pub use crate::buffer::manager::{
        BufferManager, BufferManagerConfig, MigrationPolicy, PageGuard, PoolTier,
    };
    pub use crate::buffer::page::{INVALID_PAGE_ID, PageID, PageSizeClass};
    pub use crate::error::*;
    pub use crate::lifetime::StaticLifetime;
    pub use crate::scheduler::immediate::ImmediateScheduler;
    pub use crate::scheduler::node_queue::NodeQueueScheduler;
    pub use crate::scheduler::task::{SchedulePriority, Task};
    pub use crate::scheduler::topology::Topology;
    pub use crate::scheduler::{Scheduler, schedule_and_wait_for_tasks};
}
