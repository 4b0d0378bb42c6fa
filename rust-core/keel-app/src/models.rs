//! Models of the reference application.

use keel_core::{Model, ModelMeta, Relation};

/// `users` table
pub struct User;

/// `posts` table
pub struct Post;

/// `comments` table
pub struct Comment;

impl Model for User {
    fn meta() -> &'static ModelMeta {
        static META: ModelMeta = ModelMeta::new("User", "users").fillable(&["name", "email"]);
        &META
    }

    fn relation(name: &str) -> Option<Relation> {
        match name {
            "posts" => Some(Relation::has_many::<Post>("user_id")),
            _ => None,
        }
    }
}

impl Model for Post {
    fn meta() -> &'static ModelMeta {
        static META: ModelMeta = ModelMeta::new("Post", "posts").fillable(&["title", "body"]);
        &META
    }

    fn relation(name: &str) -> Option<Relation> {
        match name {
            "author" => Some(Relation::belongs_to::<User>("user_id")),
            "comments" => Some(Relation::has_many::<Comment>("post_id")),
            _ => None,
        }
    }
}

impl Model for Comment {
    fn meta() -> &'static ModelMeta {
        static META: ModelMeta = ModelMeta::new("Comment", "comments").fillable(&["body"]);
        &META
    }

    fn relation(name: &str) -> Option<Relation> {
        (name == "post").then(|| Relation::belongs_to::<Post>("post_id"))
    }
}
