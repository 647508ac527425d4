// OAuth credential handling
// Persists one token pair per external system and refreshes it on demand

mod credentials;
mod manager;
mod refresh;
mod state;
mod types;

pub use credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
pub use manager::TokenManager;
pub use state::{OAuthStateStore, MAX_STATE_TTL_SECS};
pub use types::{CredentialRecord, OAuthClient, System, TokenError};
