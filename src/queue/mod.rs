pub mod client;
pub mod coordinator;
pub mod item;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::{QueueClient, RemoteWorker};
pub use coordinator::{Completions, Coordinator, HandlerRegistry, WorkHandler};
pub use item::{WorkItem, WorkKind, WorkOutput, WorkPayload, WorkResult, WorkState};
pub use server::QueueServer;
