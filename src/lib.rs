//! A PGAS runtime core: teams of units sharing a partitioned global address
//! space, one-sided communication on global pointers, active-message queues
//! and a task runtime with data dependencies on global memory.
//!
//! Every unit owns a [Runtime], reached through the [World] built for it.
//! Units are created by [WorldBuilder::launch], which hosts each unit as a
//! thread of the calling process, or by [WorldBuilder::build], which joins
//! the job described by `DART_NUM_UNITS`, `DART_UNIT_ID` and `DART_JOB_ID`
//! with one unit per process. Units share memory through named
//! shared-memory objects in both cases.
//!
//! EXAMPLES
//! --------
//!
//! # Symmetric allocation and one-sided access
//! ```no_run
//! use dart::{Backend, WorldBuilder};
//!
//! WorldBuilder::new()
//!     .with_backend(Backend::Shmem)
//!     .launch(2, |world| {
//!         let seg = world.segment_alloc_sym(world.team_all(), 8).unwrap();
//!         if world.my_unit() == 0 {
//!             world.put_value(&seg, 0xDEADBEEFu32).unwrap();
//!         }
//!         world.barrier(world.team_all()).unwrap();
//!         assert_eq!(world.get_value::<u32>(&seg).unwrap(), 0xDEADBEEF);
//!     });
//! ```
//!
//! # Active messages
//! ```no_run
//! use dart::{register_action, action_name, ActionContext, WorldBuilder};
//!
//! fn hello(ctx: &ActionContext, payload: &[u8]) {
//!     println!("unit {} says {:?}", ctx.sender(), payload);
//! }
//! register_action!(hello);
//!
//! WorldBuilder::new().launch(2, |world| {
//!     let amq = world.amq_open(64, 16, world.team_all()).unwrap();
//!     let token = world.action_id(action_name!(hello)).unwrap();
//!     amq.send((world.my_unit() + 1) % 2, token, b"hi").unwrap();
//!     amq.process_blocking().unwrap();
//!     amq.close().unwrap();
//! });
//! ```
//!
//! # Tasks with dependencies
//! ```no_run
//! use dart::{Dependency, Priority, WorldBuilder};
//!
//! let world = WorldBuilder::new().build().unwrap();
//! let x = world.segment_alloc_local(8).unwrap();
//! for i in 0..10u64 {
//!     world
//!         .task_create(&[Dependency::inout(x)], Priority::Low, move |ctx| async move {
//!             let v: u64 = ctx.runtime().get_value(&x).unwrap();
//!             assert_eq!(v, i);
//!             ctx.runtime().put_value(&x, v + 1).unwrap();
//!         })
//!         .unwrap();
//! }
//! world.task_complete().unwrap();
//! ```

#[macro_use]
extern crate lazy_static;

mod alloc;
pub mod amq;
mod barrier;
pub mod comm;
mod env_var;
mod error;
mod gptr;
mod segment;
pub mod tasking;
mod team;
mod transport;
mod warnings;
mod world;

pub use crate::amq::{record_len, ActionContext, ActionFn, ActionId, AmQueue};
pub use crate::comm::{DartAtomic, Handle, Plain, ReduceOp};
pub use crate::env_var::{config, AmqImpl, Config};
pub use crate::error::{DartError, DartResult};
pub use crate::gptr::{GlobalPtr, SegmentId, TeamId};
pub use crate::segment::{Resolved, SegmentKind, WindowId};
pub use crate::tasking::{
    DepKind, Dependency, Priority, TaskContext, TaskHandle, TaskRef, TaskStatus,
};
pub use crate::transport::Backend;
pub use crate::world::{Runtime, ThreadLevel, World, WorldBuilder};

#[doc(hidden)]
pub use inventory;

#[doc(hidden)]
pub fn serialize<T: ?Sized>(obj: &T) -> DartResult<Vec<u8>>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

#[doc(hidden)]
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> DartResult<T>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}
