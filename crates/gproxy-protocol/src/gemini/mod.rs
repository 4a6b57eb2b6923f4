pub mod content;
pub mod generate_content;
pub mod types;

pub use content::{Content, ContentRole, FileData, FunctionCall, FunctionResponse, Part};
