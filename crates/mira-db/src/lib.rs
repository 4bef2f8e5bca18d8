mod catalog;
mod error;
mod escape;
mod models;
mod natural;
mod repository;
mod schema;

pub use catalog::GroupCatalog;
pub use error::DbError;
pub use escape::{contains_pattern, escape_like};
pub use models::*;
pub use natural::{group_order, natural_cmp, sort_groups};
pub use repository::MiraDb;
