//! Route handlers of the reference application.

use crate::models::{Post, User};
use keel_core::validation::{FieldError, ValidationCode, ValidationErrors};
use keel_core::{
    abort, AppConfig, DatabasePool, Error, Json, JwtGuard, Model, Paginator, Record, Request,
    Result, VERSION,
};
use serde_json::{json, Value};
use std::sync::Arc;

const PER_PAGE: u64 = 15;

fn page(req: &Request) -> u64 {
    req.query("page")
        .and_then(|p| p.parse().ok())
        .filter(|p| *p > 0)
        .unwrap_or(1)
}

/// Id of the authenticated user
fn current_user_id(req: &Request) -> Result<i64> {
    req.user()
        .and_then(|claims| claims["sub"].as_str())
        .and_then(|sub| sub.parse().ok())
        .ok_or_else(|| Error::Unauthorized {
            message: "Unauthenticated.".to_string(),
        })
}

/// `GET /`
pub async fn home(_req: Request, config: Arc<AppConfig>) -> Result<Value> {
    Ok(json!({"name": config.name, "version": VERSION}))
}

/// `GET /api/users`
pub async fn list_users(req: Request, db: Arc<DatabasePool>) -> Result<Json<Paginator<Record>>> {
    let users = User::query(&db)
        .with(["posts"])
        .order_by("id")
        .paginate(page(&req), PER_PAGE)
        .await?;
    Ok(Json(users))
}

/// `GET /api/users/{id:int}`
pub async fn show_user(req: Request, db: Arc<DatabasePool>) -> Result<Value> {
    let id = req.param_int("id").ok_or_else(|| abort(404, "Not Found"))?;
    let user = User::query(&db)
        .with(["posts.comments"])
        .find_or_fail(id)
        .await?;
    Ok(user.to_json())
}

/// `POST /api/users` - register and receive a token
pub async fn register(req: Request, deps: (Arc<DatabasePool>, Arc<JwtGuard>)) -> Result<(u16, Value)> {
    let (db, guard) = deps;
    let data = req.validate(&[
        ("name", "required|string|max:255"),
        ("email", "required|email|max:255"),
    ])?;

    let email = data.get("email").and_then(Value::as_str).unwrap_or_default();
    if User::query(&db).where_eq("email", email).exists().await? {
        let mut errors = ValidationErrors::new();
        errors.add(FieldError::new(
            "email",
            "The email has already been taken.",
            ValidationCode::NotUnique,
        ));
        return Err(Error::Validation(errors));
    }

    let user = User::query(&db).create(&data).await?;
    let id = user
        .get_i64("id")
        .ok_or_else(|| abort(500, "User was saved without an id"))?;
    let token = guard.issue(id.to_string(), &json!({"name": user.get_str("name")}))?;
    tracing::info!(user_id = id, "User registered");

    Ok((201, json!({"user": user.to_json(), "token": token})))
}

/// `GET /api/me`
pub async fn me(req: Request, db: Arc<DatabasePool>) -> Result<Value> {
    let id = current_user_id(&req)?;
    Ok(User::query(&db).find_or_fail(id).await?.to_json())
}

/// `GET /api/posts`, optionally `?user_id=`
pub async fn list_posts(req: Request, db: Arc<DatabasePool>) -> Result<Json<Vec<Record>>> {
    let author = req.query("user_id").and_then(|id| id.parse::<i64>().ok());
    let posts = Post::query(&db)
        .when(author.is_some(), |q| q.where_eq("user_id", author))
        .with(["author", "comments"])
        .latest()
        .order_by_desc("id")
        .get()
        .await?;
    Ok(Json(posts))
}

/// `POST /api/posts`
pub async fn create_post(req: Request, db: Arc<DatabasePool>) -> Result<(u16, Value)> {
    let user_id = current_user_id(&req)?;
    let data = req.validate(&[("title", "required|string|min:3|max:200"), ("body", "nullable|string")])?;

    let mut post = Record::new::<Post>();
    post.fill(&data).set("user_id", user_id);
    post.save(&db).await?;
    post.load(&db, &["author"]).await?;
    Ok((201, post.to_json()))
}

/// `DELETE /api/posts/{id:int}` - authors only
pub async fn delete_post(req: Request, db: Arc<DatabasePool>) -> Result<()> {
    let user_id = current_user_id(&req)?;
    let id = req.param_int("id").ok_or_else(|| abort(404, "Not Found"))?;
    let mut post = Post::query(&db).find_or_fail(id).await?;

    if post.get_i64("user_id") != Some(user_id) {
        return Err(Error::Forbidden {
            message: "This action is unauthorized.".to_string(),
        });
    }
    db.table("comments").where_eq("post_id", id).delete().await?;
    post.delete(&db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::migrations;
    use crate::providers::{DatabaseServiceProvider, RouteServiceProvider};
    use keel_core::{AppConfig, Application, DatabasePool, JwtGuard, Method, Request, Response};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn app() -> Application {
        let pool = DatabasePool::connect("sqlite::memory:", Some(1)).await.unwrap();
        migrations::run(&pool).await.unwrap();

        let config = AppConfig {
            key: "testing-key".to_string(),
            ..AppConfig::default()
        };
        let mut app = Application::new(config);
        app.register(DatabaseServiceProvider::new(pool))
            .register(RouteServiceProvider);
        app.bootstrap().unwrap();
        app
    }

    fn request(method: Method, path: &str, body: Option<Value>, token: Option<&str>) -> Request {
        let mut headers = HashMap::from([
            ("accept".to_string(), "application/json".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
            ("x-client-ip".to_string(), "127.0.0.1".to_string()),
        ]);
        if let Some(token) = token {
            headers.insert("authorization".to_string(), format!("Bearer {token}"));
        }
        Request::new(
            method,
            path.to_string(),
            headers,
            body.map(|b| b.to_string().into()),
        )
    }

    fn json_of(response: &Response) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    async fn register(app: &Application, name: &str, email: &str) -> (i64, String) {
        let res = app
            .handle(request(
                Method::Post,
                "/api/users",
                Some(json!({"name": name, "email": email})),
                None,
            ))
            .await;
        assert_eq!(res.status, 201, "{}", res.body);
        let body = json_of(&res);
        (
            body["user"]["id"].as_i64().unwrap(),
            body["token"].as_str().unwrap().to_string(),
        )
    }

    async fn post(app: &Application, token: &str, title: &str) -> Response {
        app.handle(request(
            Method::Post,
            "/api/posts",
            Some(json!({"title": title, "body": "text"})),
            Some(token),
        ))
        .await
    }

    #[tokio::test]
    async fn test_home() {
        let app = app().await;
        let res = app.handle(request(Method::Get, "/", None, None)).await;
        assert_eq!(res.status, 200);
        assert_eq!(json_of(&res)["name"], "Keel");
    }

    #[tokio::test]
    async fn test_register_and_me() {
        let app = app().await;
        let (id, token) = register(&app, "Ada", "ada@example.com").await;

        let me = app.handle(request(Method::Get, "/api/me", None, Some(&token))).await;
        assert_eq!(me.status, 200);
        assert_eq!(json_of(&me)["id"], id);
        assert_eq!(json_of(&me)["email"], "ada@example.com");

        let anonymous = app.handle(request(Method::Get, "/api/me", None, None)).await;
        assert_eq!(anonymous.status, 401);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let app = app().await;
        let invalid = app
            .handle(request(
                Method::Post,
                "/api/users",
                Some(json!({"name": "", "email": "nope"})),
                None,
            ))
            .await;
        assert_eq!(invalid.status, 422);
        let body = json_of(&invalid);
        assert!(body["errors"]["name"].is_array());
        assert!(body["errors"]["email"].is_array());

        register(&app, "Ada", "ada@example.com").await;
        let duplicate = app
            .handle(request(
                Method::Post,
                "/api/users",
                Some(json!({"name": "Other", "email": "ada@example.com"})),
                None,
            ))
            .await;
        assert_eq!(duplicate.status, 422);
        assert_eq!(
            json_of(&duplicate)["errors"]["email"][0],
            "The email has already been taken."
        );
    }

    #[tokio::test]
    async fn test_posts_with_eager_loaded_author() {
        let app = app().await;
        let (ada, ada_token) = register(&app, "Ada", "ada@example.com").await;
        let (_, linus_token) = register(&app, "Linus", "linus@example.com").await;

        assert_eq!(post(&app, &ada_token, "Engines").await.status, 201);
        assert_eq!(post(&app, &linus_token, "Kernels").await.status, 201);

        let all = app.handle(request(Method::Get, "/api/posts", None, None)).await;
        let posts = json_of(&all);
        assert_eq!(posts.as_array().unwrap().len(), 2);
        assert_eq!(posts[0]["title"], "Kernels");
        assert_eq!(posts[0]["author"]["name"], "Linus");
        assert_eq!(posts[1]["author"]["name"], "Ada");

        let path = format!("/api/posts?user_id={ada}");
        let filtered = json_of(&app.handle(request(Method::Get, &path, None, None)).await);
        assert_eq!(filtered.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_show_user_nests_relations() {
        let app = app().await;
        let (id, token) = register(&app, "Ada", "ada@example.com").await;
        post(&app, &token, "Engines").await;

        let path = format!("/api/users/{id}");
        let res = app.handle(request(Method::Get, &path, None, None)).await;
        assert_eq!(res.status, 200);
        let user = json_of(&res);
        assert_eq!(user["posts"][0]["title"], "Engines");
        assert!(user["posts"][0]["comments"].as_array().unwrap().is_empty());

        let missing = app.handle(request(Method::Get, "/api/users/999", None, None)).await;
        assert_eq!(missing.status, 404);

        let not_int = app.handle(request(Method::Get, "/api/users/abc", None, None)).await;
        assert_eq!(not_int.status, 404);
    }

    #[tokio::test]
    async fn test_list_users_paginates() {
        let app = app().await;
        register(&app, "Ada", "ada@example.com").await;
        register(&app, "Linus", "linus@example.com").await;

        let res = app.handle(request(Method::Get, "/api/users?page=1", None, None)).await;
        let page = json_of(&res);
        assert_eq!(page["total"], 2);
        assert_eq!(page["current_page"], 1);
        assert_eq!(page["data"][0]["name"], "Ada");
        assert!(page["data"][0]["posts"].is_array());
    }

    #[tokio::test]
    async fn test_list_users_out_of_range_page() {
        let app = app().await;
        register(&app, "Ada", "ada@example.com").await;

        let path = format!("/api/users?page={}", u64::MAX);
        let res = app.handle(request(Method::Get, &path, None, None)).await;
        assert_eq!(res.status, 200, "{}", res.body);
        let page = json_of(&res);
        assert_eq!(page["total"], 1);
        assert!(page["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_post_requires_author() {
        let app = app().await;
        let (_, ada_token) = register(&app, "Ada", "ada@example.com").await;
        let (_, linus_token) = register(&app, "Linus", "linus@example.com").await;
        let created = json_of(&post(&app, &ada_token, "Engines").await);
        let path = format!("/api/posts/{}", created["id"]);

        let forbidden = app
            .handle(request(Method::Delete, &path, None, Some(&linus_token)))
            .await;
        assert_eq!(forbidden.status, 403);

        let deleted = app
            .handle(request(Method::Delete, &path, None, Some(&ada_token)))
            .await;
        assert_eq!(deleted.status, 204);

        let again = app
            .handle(request(Method::Delete, &path, None, Some(&ada_token)))
            .await;
        assert_eq!(again.status, 404);
    }

    #[tokio::test]
    async fn test_forged_token_is_rejected() {
        let app = app().await;
        let forged = JwtGuard::new("other-key").issue("1", &Value::Null).unwrap();
        let res = post(&app, &forged, "Sneaky").await;
        assert_eq!(res.status, 401);
    }

    #[tokio::test]
    async fn test_named_routes() {
        let app = app().await;
        let params = HashMap::from([("id", "7".to_string())]);
        assert_eq!(app.router().url_for("api.users.show", &params).unwrap(), "/api/users/7");
    }
}
