//! # Wire Protocol
//!
//! Framing, sequencing, and session orchestration over a virtual
//! socket. The layering mirrors the runtime's control flow:
//!
//! - [`frame`]: the 5-byte header codec plus the step and signal
//!   sub-codecs,
//! - [`counter`]: modular step and nonce allocators,
//! - [`flow`]: the sequenced sender (`stream`) and receiver (`listen`)
//!   loops with per-message ACKs,
//! - [`session`]: the initiator (`connect`) and responder (`channel`)
//!   halves of session establishment and teardown.

pub mod counter;
pub mod flow;
pub mod frame;
pub mod session;

pub use counter::{NonceCounter, StepCounter};
pub use frame::{FrameKind, Header, Pattern, Signal};
pub use session::SessionId;
