//! Fragment rendering
//!
//! Templates are looked up as `<template>.tmpl` and rendered with:
//! - `name`: the entry name
//! - `params`: every descriptor parameter
//! - `config`: an [`EntryView`](crate::entry::EntryView) of the entry
//! - `ctx`: helpers (`slug`, `require_file`, `watch_file`, `param`,
//!   `param_int`, `param_bool`, `param_onoff`)

use crate::entry::{BackendEntry, Params};
use crate::error::RenderError;
use minijinja::value::{from_args, Object, Value};
use minijinja::{context, Environment, Error, ErrorKind, State};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Suffix appended to an entry's template name
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Renders the fragment for one entry
pub trait TemplateRenderer {
    /// Files the template watched are registered on `entry` whatever the outcome.
    fn render(&self, entry: &mut BackendEntry) -> Result<String, RenderError>;
}

/// Lowercase ASCII slug: non-ASCII dropped, runs of anything else but
/// `[a-z0-9]` collapsed to a single `_`, no leading or trailing `_`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_sep = false;
    for c in input.chars().filter(char::is_ascii) {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }
    }
    slug
}

#[derive(Debug, Default)]
struct Tracking {
    watched: Vec<PathBuf>,
    missing: Option<PathBuf>,
}

/// The `ctx` object exposed to templates
#[derive(Debug, Clone)]
struct RenderHelpers {
    params: Params,
    tracking: Arc<Mutex<Tracking>>,
}

impl RenderHelpers {
    fn new(params: Params) -> Self {
        Self {
            params,
            tracking: Arc::new(Mutex::new(Tracking::default())),
        }
    }

    fn take(&self) -> Tracking {
        std::mem::take(&mut *self.tracking.lock())
    }
}

impl Object for RenderHelpers {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "slug" => {
                let (s,): (&str,) = from_args(args)?;
                Ok(Value::from(slugify(s)))
            }
            "watch_file" => {
                let (path,): (&str,) = from_args(args)?;
                self.tracking.lock().watched.push(PathBuf::from(path));
                Ok(Value::from(path))
            }
            "require_file" => {
                let (path,): (&str,) = from_args(args)?;
                let path_buf = PathBuf::from(path);
                let mut tracking = self.tracking.lock();
                tracking.watched.push(path_buf.clone());
                if !path_buf.is_file() {
                    tracking.missing = Some(path_buf);
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        format!("missing file: {}", path),
                    ));
                }
                Ok(Value::from(path))
            }
            "param" => {
                let (name, default): (&str, Option<&str>) = from_args(args)?;
                Ok(Value::from(self.params.get_or(name, default.unwrap_or(""))))
            }
            "param_int" => {
                let (name, default): (&str, Option<i64>) = from_args(args)?;
                Ok(Value::from(self.params.get_int(name, default.unwrap_or(0))))
            }
            "param_bool" => {
                let (name, default): (&str, Option<bool>) = from_args(args)?;
                Ok(Value::from(self.params.get_bool(name, default.unwrap_or(false))))
            }
            "param_onoff" => {
                let (name, default): (&str, &str) = from_args(args)?;
                Ok(Value::from(self.params.get_onoff(name, default)))
            }
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        }
    }
}

/// MiniJinja-backed renderer
pub struct TemplateSet {
    env: Environment<'static>,
}

impl TemplateSet {
    /// Load templates lazily from `dirs`, first directory holding the file wins
    pub fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_loader(move |name| {
            for dir in &dirs {
                match std::fs::read_to_string(dir.join(name)) {
                    Ok(source) => return Ok(Some(source)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(Error::new(
                            ErrorKind::InvalidOperation,
                            format!("could not read template {} from {}", name, dir.display()),
                        )
                        .with_source(e))
                    }
                }
            }
            Ok(None)
        });
        Self { env }
    }

    /// Build from in-memory sources keyed by template name (without suffix)
    pub fn from_sources<I>(sources: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env = Environment::new();
        for (name, source) in sources {
            env.add_template_owned(format!("{}{}", name, TEMPLATE_SUFFIX), source)?;
        }
        Ok(Self { env })
    }
}

impl TemplateRenderer for TemplateSet {
    fn render(&self, entry: &mut BackendEntry) -> Result<String, RenderError> {
        let template_name = format!("{}{}", entry.template(), TEMPLATE_SUFFIX);
        let helpers = RenderHelpers::new(entry.params().clone());

        let result = self.env.get_template(&template_name).and_then(|tmpl| {
            tmpl.render(context! {
                name => entry.name(),
                params => entry.params(),
                config => entry.view(),
                ctx => Value::from_object(helpers.clone()),
            })
        });

        let tracking = helpers.take();
        for path in tracking.watched {
            entry.watch_file(path);
        }

        match (result, tracking.missing) {
            (Ok(text), _) => Ok(text),
            (Err(_), Some(path)) => Err(RenderError::MissingFile(path)),
            (Err(e), None) => Err(RenderError::Template(e)),
        }
    }
}
