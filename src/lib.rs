//! Lock-free reference-counted objects with deferred reclamation, and a
//! work-dispatch engine built on the same queue primitives.
//!
//! The object side: values allocated from an [`ObjectSpace`] are owned by
//! [`Ref`] slots. Slots swap atomically and may be shared freely across
//! threads; when the last slot lets go of an object it is queued, not
//! destroyed, and a collector thread (or any caller of
//! [`ObjectSpace::collect`]) destroys the backlog later. Releasing a deep
//! structure is therefore O(1) on the releasing thread.
//!
//! The dispatch side: [`Item`]s queue onto serial [`Task`]s, a scheduler
//! hands non-empty tasks to a cached worker pool, and delayed items fire
//! through a cancellable timer. Every item is eventually completed, worked
//! or purged, exactly once.

pub mod cell;
pub mod dispatch;
pub mod freelist;
pub mod object;
pub mod space;
pub mod sync;

pub use cell::Ref;
pub use dispatch::{
    Dispatch, DispatchConfig, Done, Item, LambdaDone, Task, Token, Wait, Worker, CC_ERROR,
    CC_ERROR_FC, CC_NORMAL, CC_PURGE, FC_RESET, FC_TRACE,
};
pub use object::ObjPtr;
pub use space::{space, ObjectSpace, SpaceConfig, SpaceCounters};

/// Unrecoverable internal fault: log, print, and abort the process.
pub(crate) fn fatal_error(msg: &str) -> ! {
    log::error!(target: "lazygc", "fatal: {}", msg);
    eprintln!("lazygc fatal: {}", msg);
    std::process::abort()
}
