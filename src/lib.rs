pub mod config;
pub mod cursor;
pub mod decoration;
pub mod delta;
pub mod diff;
pub mod document;
pub mod error;
pub mod hub;
pub mod network;
pub mod operation;
pub mod sync;
pub mod transform;

#[cfg(feature = "harness")]
pub mod harness;

pub use config::*;
pub use cursor::*;
pub use decoration::*;
pub use delta::{encode, join_lines, lines_of, Delta};
pub use diff::*;
pub use document::*;
pub use error::*;
pub use hub::*;
pub use network::*;
pub use operation::*;
pub use sync::*;
pub use transform::*;
