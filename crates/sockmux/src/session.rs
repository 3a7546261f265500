//! Session boundary collaborator.
//!
//! The multiplexer never touches credential storage or navigation directly.
//! An UNAUTHORIZED frame clears the stored credential and redirects to
//! [`LOGIN_PATH`] through this trait, which keeps the behavior testable with
//! an in-memory implementation.

/// Path of the login boundary; UNAUTHORIZED frames redirect here.
pub const LOGIN_PATH: &str = "/login";

/// Injected session/auth collaborator.
pub trait Session: Send + Sync {
    /// Wipe the stored credential
    fn clear_credential(&self);

    /// Current navigation path
    fn current_path(&self) -> String;

    /// Navigate to the login boundary
    fn redirect_to_login(&self);
}
