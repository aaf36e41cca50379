//! # Ferrule Core
//!
//! Domain types, traits, and error definitions for the Ferrule agent engine.
//! This crate has **no framework dependencies**; it defines the domain model
//! that the provider, tool, and agent crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the request loop is a trait here:
//! - [`Provider`] / [`ModelClient`] for LLM backends
//! - [`Tool`] plus the [`ToolRegistry`] capability table
//! - [`EventBus`] for best-effort structured logging
//!
//! Implementations live in their respective crates, so the loop can be
//! driven by scripted mocks in tests.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, SessionError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, Role};
pub use provider::{
    ChatOptions, ChatReply, ChunkCallback, ModelClient, Provider, ProviderRequest,
    ProviderResponse, StreamChunk, Usage,
};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
