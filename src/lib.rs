// Decoding layers, bottom up
pub mod error; // Error enum + Result alias
pub mod lzf; // LZF decompression
pub mod codec; // RdbReader: length/string/float primitives + Input cursor
pub mod ziplist; // ziplist blobs
pub mod listpack; // listpack blobs
pub mod zipmap; // legacy zipmap blobs
pub mod intset; // intset blobs
pub mod object; // TypeObject records + text/JSON/command projections
pub mod decode; // per-type value decoders
pub mod parser; // Parser, Handler, CancelToken

// Sinks and transport
pub mod format; // JSON / kv line writers
pub mod info; // aux metadata + key statistics
pub mod protocol; // RESP replies + command encoder
pub mod net; // socket2 dialing
pub mod session; // SYNC source session
pub mod client; // Destination / Connect + RESP client
pub mod limiter; // token bucket
pub mod loader; // parallel redistribution pipeline

// Re-export the public surface for easier access
pub use client::{Connect, Destination, RespClient, RespConnector};
pub use error::{Error, Result};
pub use format::{parse_to_json, parse_to_kv, JsonWriter, KvWriter};
pub use info::{collect_info, InfoCollector, InfoOptions, RdbInfo};
pub use limiter::RateLimiter;
pub use loader::{LoadConfig, LoadResult, Loader};
pub use object::*;
pub use parser::{parse, CancelToken, FnHandler, Handler, ParseOptions, Parser};
pub use protocol::Reply;
pub use session::{BoundedReader, SessionConfig, SourceSession};

// Default source address - a local Redis on its standard port
pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";
