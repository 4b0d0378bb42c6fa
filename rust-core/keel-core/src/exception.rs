//! # Exception Handler
//!
//! Turns an [`Error`] into the response the client sees: JSON for clients
//! that want JSON, an HTML page otherwise.

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use hyper::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, error};

const MASKED_MESSAGE: &str = "Server Error";
const VALIDATION_MESSAGE: &str = "The given data was invalid.";

/// Renders errors raised by handlers and middleware
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionHandler {
    debug: bool,
}

impl ExceptionHandler {
    /// Create a handler; `debug` exposes 5xx messages and the debug page
    #[must_use]
    pub const fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Whether debug output is enabled
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Render `err` for `req`
    #[must_use]
    pub fn render(&self, req: &Request, err: &Error) -> Response {
        self.report(req, err);

        let mut response = if req.wants_json() {
            self.render_json(err)
        } else {
            self.render_html(req, err)
        };

        match err {
            Error::MethodNotAllowed { allowed, .. } => {
                let allow = allowed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                response.set_header("Allow", &allow);
            }
            Error::TooManyRequests { retry_after } => {
                response.set_header("Retry-After", &retry_after.to_string());
            }
            _ => {}
        }
        response
    }

    fn report(&self, req: &Request, err: &Error) {
        let status = err.status();
        if status >= 500 {
            error!(
                method = %req.method,
                path = %req.path,
                status,
                kind = err.kind(),
                error = %err,
                "Unhandled error"
            );
        } else {
            debug!(
                method = %req.method,
                path = %req.path,
                status,
                error = %err,
                "Request failed"
            );
        }
    }

    /// Client-facing message; 5xx details stay hidden outside debug mode
    fn message(&self, err: &Error) -> String {
        if err.status() >= 500 && !self.debug {
            MASKED_MESSAGE.to_string()
        } else {
            err.to_string()
        }
    }

    fn render_json(&self, err: &Error) -> Response {
        let status = err.status();
        let body = match err {
            Error::Validation(errors) => json!({
                "message": VALIDATION_MESSAGE,
                "errors": Value::Object(errors.messages()),
            }),
            _ => json!({
                "message": self.message(err),
                "status": status,
            }),
        };
        Response::json(&body).with_status(status)
    }

    fn render_html(&self, req: &Request, err: &Error) -> Response {
        let status = err.status();
        let title = status_title(status);
        let body = if self.debug {
            format!(
                "<!DOCTYPE html>\n<html>\n<head><title>{kind}</title></head>\n<body>\n\
                 <h1>{kind}</h1>\n<p>{message}</p>\n<pre>{method} {path}</pre>\n\
                 <p>{status} {title}</p>\n</body>\n</html>\n",
                kind = err.kind(),
                message = escape_html(&err.to_string()),
                method = req.method,
                path = escape_html(&req.path),
            )
        } else {
            let message = match err {
                Error::Validation(_) => VALIDATION_MESSAGE.to_string(),
                _ => self.message(err),
            };
            format!(
                "<!DOCTYPE html>\n<html>\n<head><title>{status} {title}</title></head>\n<body>\n\
                 <h1>{status}</h1>\n<p>{}</p>\n</body>\n</html>\n",
                escape_html(&message),
            )
        };
        Response::html(body).with_status(status)
    }
}

fn status_title(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Error")
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::abort;
    use crate::router::Method;
    use crate::validation::{FieldError, ValidationErrors};
    use std::collections::HashMap;

    fn json_request() -> Request {
        let headers = HashMap::from([("accept".to_string(), "application/json".to_string())]);
        Request::new(Method::Get, "/users/1".to_string(), headers, None)
    }

    fn html_request() -> Request {
        Request::new(Method::Get, "/users/<1>".to_string(), HashMap::new(), None)
    }

    fn body(response: &Response) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn test_json_for_json_clients() {
        let err = Error::RouteNotFound {
            path: "/users/1".to_string(),
        };
        let res = ExceptionHandler::new(false).render(&json_request(), &err);
        assert_eq!(res.status, 404);
        assert_eq!(res.content_type, "application/json");
        assert_eq!(body(&res)["status"], 404);
        assert!(body(&res)["message"].as_str().unwrap().contains("/users/1"));
    }

    #[test]
    fn test_validation_errors_shape() {
        let mut errors = ValidationErrors::new();
        errors.add_required("email");
        errors.add(FieldError::too_short("name", 3));
        let res = ExceptionHandler::new(false).render(&json_request(), &Error::Validation(errors));

        assert_eq!(res.status, 422);
        let value = body(&res);
        assert_eq!(value["message"], "The given data was invalid.");
        assert_eq!(value["errors"]["email"].as_array().unwrap().len(), 1);
        assert!(value["errors"]["name"].is_array());
    }

    #[test]
    fn test_server_errors_are_masked_outside_debug() {
        let err = Error::database("no such table: users");
        let masked = ExceptionHandler::new(false).render(&json_request(), &err);
        assert_eq!(masked.status, 500);
        assert_eq!(body(&masked)["message"], "Server Error");

        let exposed = ExceptionHandler::new(true).render(&json_request(), &err);
        assert!(body(&exposed)["message"]
            .as_str()
            .unwrap()
            .contains("no such table"));
    }

    #[test]
    fn test_html_for_browsers() {
        let res = ExceptionHandler::new(false).render(&html_request(), &abort(403, "Nope"));
        assert_eq!(res.status, 403);
        assert!(res.content_type.starts_with("text/html"));
        assert!(res.body.contains("403"));
        assert!(res.body.contains("Nope"));
        assert!(!res.body.contains("Abort"));
    }

    #[test]
    fn test_debug_page_escapes_request_line() {
        let err = Error::RouteNotFound {
            path: "/users/<1>".to_string(),
        };
        let res = ExceptionHandler::new(true).render(&html_request(), &err);
        assert!(res.body.contains("RouteNotFound"));
        assert!(res.body.contains("GET /users/&lt;1&gt;"));
        assert!(!res.body.contains("<1>"));
    }

    #[test]
    fn test_allow_and_retry_after_headers() {
        let handler = ExceptionHandler::default();
        let not_allowed = Error::MethodNotAllowed {
            path: "/users".to_string(),
            allowed: vec![Method::Get, Method::Post],
        };
        let res = handler.render(&json_request(), &not_allowed);
        assert_eq!(res.status, 405);
        assert_eq!(res.header("allow"), Some("GET, POST"));

        let throttled = handler.render(&json_request(), &Error::TooManyRequests { retry_after: 12 });
        assert_eq!(res.status, 405);
        assert_eq!(throttled.status, 429);
        assert_eq!(throttled.header("retry-after"), Some("12"));
    }
}
