mod controller;
mod queue;
mod registry;
mod session;

pub use controller::QueueController;
pub use registry::SessionRegistry;
