pub mod agents;
pub mod apps;
pub mod common;
pub mod events;
pub mod groups;
pub mod jobs;
pub mod procedures;
pub mod resources;
pub mod subscriptions;
