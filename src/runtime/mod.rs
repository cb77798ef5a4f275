//! Fetcher, worker and collector nodes.

pub mod command;
pub mod node;
pub mod work;

pub use command::CommandFetch;
pub use node::WorkerRoleRuntime;
pub use work::{
    error_payload, Aggregate, ArrayAggregate, Compute, FetchExecutor, PassThrough, RoleWork,
    StaticFetch,
};
