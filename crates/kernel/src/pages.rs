//! Login, callback and error pages.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use tera::Tera;
use tracing::error;

const LOGIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Sign in · Flowra</title></head>
<body>
  <main class="login">
    <h1>Sign in to Flowra</h1>
    <a class="button" id="login" href="{{ authorization_url }}">Continue with single sign-on</a>
  </main>
</body>
</html>
"#;

const CALLBACK_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="0; url={{ redirect }}">
  <title>Signing in · Flowra</title>
</head>
<body>
  <p>Signed in. <a id="next" href="{{ redirect }}">Continue</a></p>
  <script>window.location.replace(document.getElementById("next").getAttribute("href"));</script>
</body>
</html>
"#;

const ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Sign-in failed · Flowra</title></head>
<body>
  <main class="error">
    <h1>Sign-in failed</h1>
    <p>{{ message }}</p>
    <a href="{{ login_path }}">Try again</a>
  </main>
</body>
</html>
"#;

/// Renders the auth pages from built-in templates.
#[derive(Debug, Clone)]
pub struct Pages {
    tera: Tera,
    login_path: String,
}

impl Pages {
    pub fn new(login_path: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("login.html", LOGIN_TEMPLATE),
            ("callback.html", CALLBACK_TEMPLATE),
            ("error.html", ERROR_TEMPLATE),
        ])
        .context("failed to compile page templates")?;

        Ok(Self {
            tera,
            login_path: login_path.to_string(),
        })
    }

    fn render(&self, template: &str, context: &tera::Context) -> Result<String> {
        self.tera
            .render(template, context)
            .with_context(|| format!("failed to render {template}"))
    }

    /// The login page pointing at `authorization_url`.
    pub fn login(&self, authorization_url: &str) -> Response {
        let mut context = tera::Context::new();
        context.insert("authorization_url", authorization_url);
        match self.render("login.html", &context) {
            Ok(html) => Html(html).into_response(),
            Err(e) => fallback(e),
        }
    }

    /// The page that sends the browser on to `redirect` after login.
    pub fn callback(&self, redirect: &str) -> Response {
        let mut context = tera::Context::new();
        context.insert("redirect", redirect);
        match self.render("callback.html", &context) {
            Ok(html) => Html(html).into_response(),
            Err(e) => fallback(e),
        }
    }

    /// A failed sign-in. Answers 400 so clients do not treat it as success.
    pub fn error(&self, message: &str) -> Response {
        let mut context = tera::Context::new();
        context.insert("message", message);
        context.insert("login_path", &self.login_path);
        match self.render("error.html", &context) {
            Ok(html) => (StatusCode::BAD_REQUEST, Html(html)).into_response(),
            Err(e) => fallback(e),
        }
    }
}

fn fallback(e: anyhow::Error) -> Response {
    error!(error = %e, "page rendering failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("<!DOCTYPE html><p>Something went wrong.</p>".to_string()),
    )
        .into_response()
}
