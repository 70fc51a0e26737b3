pub mod oauth;
pub mod sqlite;
pub mod store;
pub mod token;

pub use oauth::{AuthorizeParams, OAuthServer, TokenParams, TokenResponse};
pub use sqlite::SqliteAuthStore;
pub use store::{AuthCode, AuthStore, MemoryAuthStore, StoredToken};
pub use token::{hash_token, Claims};
