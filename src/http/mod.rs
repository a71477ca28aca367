//! HTTP surface
//!
//! A small JSON API under `/api/v1` plus the WebSocket stream endpoint.
//! The browser player and settings UI are external; they only ever talk
//! to these routes.

pub mod handlers;
pub mod routes;

pub use routes::create_router;
