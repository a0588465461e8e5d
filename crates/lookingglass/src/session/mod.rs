//! Session registry, allocation and lifecycle management.

mod allocator;
mod error;
mod models;
mod registry;
mod service;

pub use allocator::{
    GUEST_TOKEN_LEN, PortAllocator, SESSION_ID_LEN, generate_guest_token, generate_session_id,
    is_valid_session_id,
};
pub use error::{SessionError, SessionResult};
pub use models::Session;
pub use registry::SessionRegistry;
pub use service::{ReconcileReport, SessionService};
