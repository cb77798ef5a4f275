//! Message vocabulary shared by the master and every node.
//!
//! Every message is a [`Message`]: a sender [`Endpoint`], an optional job id,
//! and a typed [`Payload`]. The payload's serde tag is the wire `type`, drawn
//! from the closed set in [`MessageType`]; decoding anything else fails with
//! [`MeshError::UnknownMessageType`](crate::error::MeshError::UnknownMessageType).
//!
//! | type                | from → to                                   |
//! |---------------------|---------------------------------------------|
//! | `create-job`        | external → master                           |
//! | `*-created`         | node → master                               |
//! | `new-job`           | master → assigned node                      |
//! | `kill-job`          | external → master, master → busy nodes      |
//! | `fetch`             | master → fetcher                            |
//! | `receive-fetch`     | fetcher → master → worker                   |
//! | `push-results`      | worker → master → collectors                |
//! | `get-results`       | collector/external → master                 |
//! | `worker-results`    | master → requester                          |
//! | `result`            | collector → master                          |

pub mod message;
pub mod types;

pub use message::{Message, MessageType, Payload};
pub use types::{
    Endpoint, FetchDirective, JobId, JobResult, JobSpec, NodeId, Role, SlotAssignment,
};
