//! MCP protocol data model.
//!
//! Wire shapes follow the MCP JSON schema: camelCase field names, optional
//! fields omitted when absent, and `_meta` threading for progress tokens.

pub mod capabilities;
pub mod content;
pub mod core;
pub mod elicitation;
pub mod initialization;
pub mod notifications;
pub mod prompts;
pub mod resources;
pub mod roots;
pub mod sampling;
pub mod tasks;
pub mod tools;

pub use capabilities::*;
pub use content::*;
pub use core::*;
pub use elicitation::*;
pub use initialization::*;
pub use notifications::*;
pub use prompts::*;
pub use resources::*;
pub use roots::*;
pub use sampling::*;
pub use tasks::*;
pub use tools::*;
