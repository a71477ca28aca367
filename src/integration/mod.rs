//! Integration tests over synthetic volumes
//!
//! `fixtures` builds byte-exact volume images (master index + sparse
//! containers with real Annex-B data and trailing frame tables) in temp
//! directories; `e2e` drives the storage manager, the seek oracle and the
//! WebSocket session against them.

pub mod fixtures;

mod e2e;
