//! HelpMe account backend: device registration, device list and the local
//! login session.

pub mod devices;
pub mod http;
pub mod registration;
pub mod session;

pub use devices::{Device, SharedUser};
pub use http::{ApiClient, ApiError, DEFAULT_API_BASE, DEFAULT_TIMEOUT};
pub use registration::RegisterOutcome;
pub use session::{SessionStore, SessionStoreError, UserInfo, helpme_home};
