//! Template engine
//!
//! minijinja environment with a fixed function set. Missing variables
//! render as the literal `<no value>` - several consumers pin that exact
//! token, so the formatter must never be swapped for an empty-string
//! rendering.

use std::fmt::Write as _;

use loom_common::Error;
use minijinja::{Environment, UndefinedBehavior};

use super::filters;
use super::Variables;

/// Stateless, thread-safe template engine.
///
/// The function map is immutable after construction; a single engine is
/// shared by every reconcile.
pub struct Engine {
    env: Environment<'static>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with the full helper set registered
    pub fn new() -> Self {
        let mut env = Environment::new();

        // Chainable lets `{{ missing.nested }}` resolve to undefined
        // instead of erroring; the formatter below decides how undefined
        // prints.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_formatter(|out, state, value| {
            if value.is_undefined() {
                write!(out, "<no value>").map_err(|_| {
                    minijinja::Error::new(
                        minijinja::ErrorKind::WriteFailure,
                        "failed to write template output",
                    )
                })
            } else {
                minijinja::escape_formatter(out, state, value)
            }
        });

        // Domain helpers, usable in both pipeline and call position
        env.add_filter("toHost", |s: &str| filters::to_host(s));
        env.add_filter("trunc63", |s: &str| filters::trunc63(s));
        env.add_function("toHost", |s: &str| filters::to_host(s));
        env.add_function("trunc63", |s: &str| filters::trunc63(s));

        // General-purpose helpers not covered by minijinja built-ins
        // (upper/lower/title/trim/replace/join/default/min/max come built in)
        env.add_filter("quote", filters::quote);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("b64enc", |s: &str| filters::b64enc(s));
        env.add_filter("b64dec", |s: &str| filters::b64dec(s));
        env.add_filter("sha1sum", |s: &str| filters::sha1sum(s));
        env.add_filter("sha256sum", |s: &str| filters::sha256sum(s));
        env.add_filter("toJson", filters::to_json);
        env.add_filter("fromJson", |s: &str| filters::from_json(s));

        env.add_function("sha1sum", |s: &str| filters::sha1sum(s));
        env.add_function("sha256sum", |s: &str| filters::sha256sum(s));
        env.add_function("fromJson", |s: &str| filters::from_json(s));
        env.add_function("ternary", filters::ternary);
        env.add_function("add", filters::add);
        env.add_function("max", filters::max_fn);
        env.add_function("min", filters::min_fn);
        env.add_function("list", filters::list);
        env.add_function("printf", filters::printf);

        Self { env }
    }

    /// Render a template string with the given variables.
    ///
    /// An empty template renders as the empty string with no error. Given
    /// the same template and variables, two renders produce byte-identical
    /// output.
    ///
    /// # Errors
    ///
    /// Fails on unclosed tags, unknown helpers, or type-incompatible
    /// pipelines; the error quotes the offending template.
    pub fn render(&self, template: &str, vars: &Variables) -> Result<String, Error> {
        if template.is_empty() {
            return Ok(String::new());
        }

        self.env
            .render_str(template, vars)
            .map_err(|e| Error::template(template, render_error_detail(&e)))
    }

    /// Render every value of a map; the result is a new map.
    ///
    /// A failure reports which key could not be rendered.
    pub fn render_map(
        &self,
        map: &std::collections::BTreeMap<String, String>,
        vars: &Variables,
    ) -> Result<std::collections::BTreeMap<String, String>, Error> {
        let mut out = std::collections::BTreeMap::new();
        for (key, template) in map {
            let rendered = self.render(template, vars).map_err(|e| {
                Error::template(template.clone(), format!("failed to render key {key:?}: {e}"))
            })?;
            out.insert(key.clone(), rendered);
        }
        Ok(out)
    }

    /// Check that a template parses, without rendering it
    pub fn validate(&self, template: &str) -> Result<(), Error> {
        if template.is_empty() {
            return Ok(());
        }
        self.env
            .template_from_str(template)
            .map(|_| ())
            .map_err(|e| Error::template(template, render_error_detail(&e)))
    }
}

/// Flatten a minijinja error chain into one message
fn render_error_detail(err: &minijinja::Error) -> String {
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}
