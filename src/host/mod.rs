//! Host side: serves the control protocol over stdio and runs the
//! tool-calling loop against a model backend.

pub mod catalog;
pub mod dispatch;
pub mod echo;
pub mod model;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod sink;
pub mod tools;

pub use catalog::Catalog;
pub use dispatch::Host;
pub use echo::EchoModel;
pub use model::{Model, ModelEvent, ModelInput, ModelRegistry, ModelThread};
pub use orchestrator::{Orchestrator, RetryPolicy};
pub use server::serve;
pub use session::{Session, SessionRegistry};
pub use sink::{CollectingSink, EventSink, HostWriter, ResponseSink};
pub use tools::{Tool, ToolRegistry, Toolkit};
