//! LLM Provider implementations for Ferrule.
//!
//! All providers implement the `ferrule_core::Provider` trait. The
//! [`FallbackChain`] wraps them into the `ModelClient` the request loop uses.

pub mod fallback;
pub mod openai_compat;
pub mod router;

pub use fallback::FallbackChain;
pub use openai_compat::OpenAiCompatProvider;
pub use router::{build_from_config, default_base_url};
