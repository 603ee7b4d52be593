//! Tool execution registry and the built-in tutor tools.

pub mod handlers;
pub mod question_log;
pub mod registry;
pub mod types;

pub use handlers::{register_builtin_tools, ToolServices};
pub use question_log::{QuestionEntry, QuestionLog};
pub use registry::{ToolHandler, ToolRegistry};
pub use types::{ToolContext, ToolFailure, ToolInvocation, ToolResult};
