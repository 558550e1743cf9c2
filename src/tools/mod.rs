mod memory;
mod message;
mod registry;
mod schedule;
mod spawn;

pub use memory::RememberTool;
pub use message::SendMessageTool;
pub use registry::ToolRegistry;
pub use schedule::ManageScheduleTool;
pub use spawn::SpawnSubagentTool;
