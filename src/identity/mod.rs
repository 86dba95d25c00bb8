//! Identity translation and per-identity execution contexts.
//! Keep the public surface thin and split implementation across sub-modules.

mod context;
mod mapper;

pub use context::{ContextFactory, ExecutionContext};
pub use mapper::{IdentityMapper, LocalIdentity, StaticIdentityMapper};
