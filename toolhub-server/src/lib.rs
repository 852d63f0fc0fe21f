//! HTTP surface, request pipeline, and enhancement service fronting
//! `toolhub-mcp`. Split out as a library so `http::build_router` can be
//! exercised with `tower::ServiceExt::oneshot` from tests without going
//! through a bound socket.

pub mod audit;
pub mod config;
pub mod enhancement;
pub mod error;
pub mod http;
pub mod llm_client;
pub mod pipeline;
pub mod state;
