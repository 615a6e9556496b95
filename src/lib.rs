//! AVALON - Embedded Ordered Key-Value Store
//!
//! Writes are buffered in an AVL tree and flushed by a background worker into
//! immutable, key-range-tagged segment files. Reads fall back from the buffer
//! through the segments newest-first.
//!
//! ## Features
//! - **AVL MemTable**: arena-backed balanced tree with tombstones
//! - **Segments**: CRC32-framed files whose key range can be read without the body
//! - **Flush Worker**: bounded hand-off queue with backpressure on writers
//! - **Read Path**: range-based segment pruning, tombstones shadow older data
//! - **Key Orders**: natural or injected comparators
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use avalon::{config::Config, engine::Avalon};
//!
//! let engine: Avalon<u64, String> = Avalon::open(Config::new("./data")).unwrap();
//!
//! engine.put(1, "one".to_string()).unwrap();
//! assert_eq!(engine.get(&1), Some("one".to_string()));
//! engine.close().unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::Config;
pub use engine::Avalon;
pub use error::{AvalonError, Result};
pub use types::{KeyOrder, Lookup, NaturalOrder, ReverseOrder};
