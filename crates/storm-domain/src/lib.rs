pub mod error;
pub mod id;
pub mod keys;
pub mod types;

pub use error::ValidationErrors;
pub use id::{b62uuid_decode, b62uuid_encode, b62uuid_new, EntityKind, StormId};
pub use keys::{escape_keys, unescape_keys};
pub use types::{
    Agent, AgentStatus, Application, ComponentLink, Event, EventType, Group, Job, JobStatus,
    Procedure, Protocol, Resource, ResourceHealth, ResourceStatus, Service, ServiceReference,
    Subscription,
};
