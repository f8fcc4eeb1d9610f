pub mod chat;
pub mod mcp;
