pub mod error;
pub mod config;
pub mod correlation;
pub mod paths;
pub mod types;
pub mod events;
pub mod identity;
pub mod lowlevel;
pub mod acl;
pub mod sensitivity;
pub mod core_fs;
pub mod indexing;
pub mod bulk;

pub use bulk::{BulkTransferEngine, BulkUploadReport};
pub use core_fs::CoreFsService;
pub use error::{FsError, FsResult};
pub use indexing::{DiffResult, IndexingEngine, TreeSource};
pub use sensitivity::{SensitivityEngine, SensitivityResolution};
