//! KDL configuration parsing for imagebuild.
//!
//! A configuration file selects the job queue backing and tunes the
//! heartbeat supervisor:
//!
//! ```kdl
//! queue {
//!     storage-root "/var/lib/imagebuild/jobs"
//!     file-mode 0o600
//! }
//! supervisor {
//!     heartbeat-timeout-secs 120
//! }
//! ```

pub mod error;
pub mod queue;

pub use error::{ConfigError, ConfigResult};
pub use queue::{
    Backing, Config, DATABASE_URL_ENV, STORAGE_ROOT_ENV, SupervisorConfig, load_config,
    parse_config,
};
