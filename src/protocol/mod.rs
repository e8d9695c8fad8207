//! Git wire-protocol plumbing shared by the transports: pkt-line framing and
//! receive-pack command parsing. The pack streams themselves belong to the
//! git server-side programs; nothing here inspects pack data.

pub mod pkt;
pub mod refs;

pub use refs::{PushSniffer, RefKind, RefUpdate};
