pub mod mcp_handlers;
