//! Service providers of the reference application.

use crate::controllers;
use keel_core::{Application, DatabasePool, GroupAttributes, Result, ServiceProvider};

/// Shares the connection pool through the container
pub struct DatabaseServiceProvider {
    pool: DatabasePool,
}

impl DatabaseServiceProvider {
    /// Provide `pool` as the application's database
    #[must_use]
    pub const fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl ServiceProvider for DatabaseServiceProvider {
    fn name(&self) -> &'static str {
        "DatabaseServiceProvider"
    }

    fn register(&self, app: &mut Application) -> Result<()> {
        app.container().instance(self.pool.clone());
        Ok(())
    }
}

/// Registers the application's routes
pub struct RouteServiceProvider;

impl ServiceProvider for RouteServiceProvider {
    fn name(&self) -> &'static str {
        "RouteServiceProvider"
    }

    fn register(&self, app: &mut Application) -> Result<()> {
        let router = app.router_mut();
        router.get("/", controllers::home)?.name("home");

        let api = GroupAttributes::prefix("api").middleware(["api"]).name("api.");
        router.group(api, |r| {
            r.get("/users", controllers::list_users)?.name("users.index");
            r.post("/users", controllers::register)?.name("users.store");
            r.get("/users/{id:int}", controllers::show_user)?.name("users.show");
            r.get("/posts", controllers::list_posts)?.name("posts.index");

            r.group(GroupAttributes::new().middleware(["auth"]), |r| {
                r.get("/me", controllers::me)?.name("me");
                r.post("/posts", controllers::create_post)?.name("posts.store");
                r.delete("/posts/{id:int}", controllers::delete_post)?
                    .name("posts.destroy");
                Ok(())
            })
        })
    }

    fn boot(&self, app: &mut Application) -> Result<()> {
        app.make::<DatabasePool>().map(|_| ())
    }
}
