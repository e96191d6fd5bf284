pub mod attachments;
pub mod options;
pub mod orchestrator;
pub mod privilege;
pub mod progress;
pub mod reference;
pub mod transform;
