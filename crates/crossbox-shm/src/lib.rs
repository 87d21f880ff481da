//! crossbox-shm: The wire format between the crossbox host and guest.
//!
//! Both processes map the same fixed-size shared memory region and interpret
//! it through the [`Channel`] struct defined here. The layout is the wire
//! format: it is position-dependent, so host and guest must be built from the
//! same version of this crate for the same target.
//!
//! A channel carries one outstanding request at a time. The only
//! synchronization primitive is the channel's atomic state word; every other
//! field is protocol-ordered payload whose ownership alternates between the
//! two processes as the state word transitions (see [`ChannelState`]).

pub mod channel;
pub mod tags;

pub use channel::{
    Channel, ChannelDead, ChannelState, Payload, RequestKind, ARG_STORAGE, CHANNEL_SIZE, MAX_ARGS,
    MAX_SYMBOL_NAME, RESULT_STORAGE, XFER_OFFSET, XFER_STORAGE,
};
pub use channel::{futex_wait, futex_wake};
pub use tags::TypeTag;
