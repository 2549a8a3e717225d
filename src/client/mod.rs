//! Caller side: launches a host, correlates replies and aggregates streams.

pub mod aggregator;
pub mod api;
pub mod command;
pub mod queue;
pub mod reader;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use aggregator::{ChatAggregator, ChatOutcome, ChatStream, ChatUpdate};
pub use api::{ClientOptions, HostClient, TriggerResponse};
pub use command::parse_command;
pub use supervisor::{ProcessState, StopOutcome, Supervisor, SupervisorOptions};
pub use transport::{StreamHandle, Transport, TransportOptions};
