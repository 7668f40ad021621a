//! Holdall: the location hierarchy engine behind a shared household storage
//! catalog.
//!
//! Households own a forest of storage locations with items nested inside
//! them. The engine keeps that forest consistent (no cycles, no dangling
//! parents, no silent cascades), previews the blast radius of a subtree move
//! before committing it, and merges lexical and semantic search signals into
//! one deterministic ranking, all behind per-household role checks.

pub mod db;
pub mod error;
pub mod household;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod moves;
pub mod search;
pub mod security;
pub mod time;
pub mod tree;

pub use error::{AppError, AppResult};
pub use model::{Household, Invitation, Item, Location, Member, Role};
pub use moves::{MovePreview, MoveReceipt, PreviewStore};
pub use search::{SearchMode, SearchResponse};
pub use security::{Ctx, Operation};
