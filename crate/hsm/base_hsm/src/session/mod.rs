mod keygen;
mod manager;
mod session_impl;

pub use keygen::KeyHandle;
pub(crate) use manager::SessionManager;
pub use manager::{SessionFlags, SessionHandle, SessionState};
pub(crate) use session_impl::Session;
