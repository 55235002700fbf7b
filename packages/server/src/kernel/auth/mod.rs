//! Authentication: bearer tokens and local user accounts.

pub mod tokens;
pub mod users;

pub use tokens::{Claims, Role, TokenService, TokenType};
pub use users::{users_entity, User, UserStore, USERS_TABLE};
