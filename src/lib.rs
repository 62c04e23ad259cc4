#![forbid(unsafe_code)]
#![allow(clippy::needless_raw_string_hashes)]

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod locks;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;

pub use codec::{TypingLog, decode, decode_auto};
pub use config::Config;
pub use error::{TlError, TlResult};
pub use locks::{LockName, LockRegistry};
pub use metrics::{Metrics, compute_metrics};
pub use model::{Partition, Profile, RaceRecord, SyncReport};
pub use remote::{HttpSource, RaceSource, TextObserver};
pub use storage::RaceStore;
pub use sync::{SyncOutcome, SyncPipeline};
