//! Value binding layer
//!
//! ```text
//!   remote party                          engine (worker thread only)
//! ┌──────────────┐   protocol::WireValue  ┌───────────────────────────┐
//! │  JSON wire   │ ◄────────────────────► │  js::Marshaller           │
//! │  values      │                        │  ├─ prelude helpers        │
//! └──────────────┘                        │  └─ handle/callback lookup │
//!                                         └───────────────────────────┘
//! ```
//!
//! `protocol` is pure data and can be used from any thread. `js` touches
//! engine values and therefore only runs inside a worker task.

pub mod js;
pub mod protocol;

pub use js::{Marshaller, Prelude};
pub use protocol::{
    CallbackInvocation, CallbackReply, DictKey, HandleMeta, HandleRef, TransportRequest,
    TransportResponse, WireValue,
};
