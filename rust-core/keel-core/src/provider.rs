//! Service providers: the place where an application binds services,
//! registers routes and configures middleware.

use crate::application::Application;
use crate::error::Result;

/// Two-phase bootstrapping hook
///
/// `register` runs for every provider before any `boot`, so `boot` may
/// rely on services bound by other providers.
pub trait ServiceProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &'static str;

    /// Bind services into the container
    ///
    /// # Errors
    ///
    /// Any error aborts bootstrapping.
    fn register(&self, app: &mut Application) -> Result<()>;

    /// Finish setup once every provider has registered
    ///
    /// # Errors
    ///
    /// Any error aborts bootstrapping.
    fn boot(&self, _app: &mut Application) -> Result<()> {
        Ok(())
    }
}
