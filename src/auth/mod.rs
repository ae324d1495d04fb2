// Authentication module
// Credential storage, session hooks, and single-flight token refresh

mod types;
mod refresh;

pub mod coordinator;
pub mod session;
pub mod store;

pub use coordinator::{RefreshCoordinator, RefreshPhase, DEFAULT_REFRESH_DEBOUNCE};
pub use refresh::{parse_token_envelope, refresh_tokens};
pub use session::{LoggingSessionHooks, SessionHooks};
pub use store::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
pub use types::{token_preview, CredentialPair, LoginRequest, REFRESH_TOKEN_KEY, TOKEN_KEY};
