//! Node process: gRPC services, admin HTTP and startup/shutdown wiring

pub mod grpc;
pub mod http;
pub mod server;

pub use grpc::{KvStoreService, MembershipService};
pub use http::{create_router, AdminState};
pub use server::{Node, RunningNode};
