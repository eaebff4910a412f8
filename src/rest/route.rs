//! # Routes (route.rs)
//!
//! Turns an endpoint template plus its arguments into two strings:
//!
//! - the **endpoint**: the concrete path that is requested
//! - the **route key**: the ratelimit group candidate used before the
//!   provider tells us the real bucket hash
//!
//! ## Key Shape
//!
//! ```text
//!     DELETE /channels/%u/messages/%u   (123, 111)
//!        │       │     │     │      │
//!        ▼       ▼     ▼     ▼      ▼
//!       ":0" ":channels" ":123" ":messages" ":%u"
//!
//!     key = ":0:channels:123:messages:%u"
//!
//!     - ids following `channels` / `guilds` are major parameters and
//!       are kept literally
//!     - every other segment is kept as template text
//!     - nothing after a `reactions` segment takes part in the key
//! ```
//!
//! ## Placeholders
//!
//! | placeholder | argument          |
//! |-------------|-------------------|
//! | `%u`        | [`RouteArg::Id`]  |
//! | `%s`        | [`RouteArg::Str`] |
//! | `%d`        | [`RouteArg::Int`] |
//!
//! Templates are static strings written by endpoint wrappers, so a
//! placeholder/argument mismatch or an oversized key is a programming error
//! and panics.

use std::fmt::{self, Write as _};

/// Upper bound (exclusive) for a generated route key.
pub const ROUTE_LEN: usize = 256;

/// Upper bound (exclusive) for a formatted endpoint.
pub const ENDPT_LEN: usize = 512;

/// HTTP methods understood by the REST core.
///
/// The discriminants are the codes used as route key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    /// `DELETE`
    Delete = 0,
    /// `GET`
    #[default]
    Get = 1,
    /// `POST` with a JSON body
    Post = 2,
    /// `POST` with a `multipart/form-data` body (file uploads)
    MimePost = 3,
    /// `PATCH`
    Patch = 4,
    /// `PUT`
    Put = 5,
}

impl Method {
    /// Code used when keying; multipart posts share the plain `POST` groups.
    pub fn key_code(self) -> u8 {
        match self {
            Method::MimePost => Method::Post as u8,
            other => other as u8,
        }
    }

    /// Verb sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Post | Method::MimePost => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A positional argument substituted into an endpoint template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteArg<'a> {
    /// Snowflake id, fills `%u`.
    Id(u64),
    /// Free text, fills `%s`.
    Str(&'a str),
    /// Signed integer, fills `%d`.
    Int(i64),
}

impl fmt::Display for RouteArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteArg::Id(id) => write!(f, "{}", id),
            RouteArg::Str(s) => f.write_str(s),
            RouteArg::Int(n) => write!(f, "{}", n),
        }
    }
}

/// Endpoint and route key of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Concrete request path, e.g. `/channels/123/messages`.
    pub endpoint: String,
    /// Ratelimit group candidate, e.g. `:1:channels:123:messages`.
    pub key: String,
}

impl Route {
    /// Formats the endpoint and builds the route key in one go.
    ///
    /// # Panics
    ///
    /// If the arguments do not match the template's placeholders, or either
    /// string overruns its bound.
    ///
    /// # Example
    ///
    /// ```rust
    /// use winecord::{Method, Route, RouteArg};
    ///
    /// let route = Route::new(Method::Get, "/channels/%u/messages", &[RouteArg::Id(123)]);
    /// assert_eq!(route.endpoint, "/channels/123/messages");
    /// assert_eq!(route.key, ":1:channels:123:messages");
    /// ```
    pub fn new(method: Method, template: &str, args: &[RouteArg<'_>]) -> Self {
        Self {
            endpoint: format_endpoint(template, args),
            key: build_key(method, template, args),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Id,
    Str,
    Int,
}

fn placeholder_of(c: Option<char>) -> Placeholder {
    match c {
        Some('u') => Placeholder::Id,
        Some('s') => Placeholder::Str,
        Some('d') => Placeholder::Int,
        other => panic!("Internal error: Missing check for '%{}'", other.map(String::from).unwrap_or_default()),
    }
}

fn check_arg<'a>(kind: Placeholder, arg: Option<&RouteArg<'a>>) -> RouteArg<'a> {
    match (kind, arg) {
        (Placeholder::Id, Some(a @ RouteArg::Id(_)))
        | (Placeholder::Str, Some(a @ RouteArg::Str(_)))
        | (Placeholder::Int, Some(a @ RouteArg::Int(_))) => *a,
        (kind, Some(a)) => panic!("Internal error: placeholder {:?} does not accept {:?}", kind, a),
        (kind, None) => panic!("Internal error: missing argument for placeholder {:?}", kind),
    }
}

/// Substitutes `args` into `template`.
///
/// # Panics
///
/// On placeholder/argument mismatch, leftover arguments, or when the result
/// reaches [`ENDPT_LEN`].
pub fn format_endpoint(template: &str, args: &[RouteArg<'_>]) -> String {
    let mut endpoint = String::with_capacity(template.len() + 16 * args.len());
    let mut args = args.iter();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            endpoint.push(c);
            continue;
        }
        let arg = check_arg(placeholder_of(chars.next()), args.next());
        let _ = write!(endpoint, "{}", arg);
    }

    assert!(args.next().is_none(), "Internal error: too many arguments for '{}'", template);
    assert!(endpoint.len() < ENDPT_LEN, "Out of bounds write attempt");
    endpoint
}

fn push_section(key: &mut String, section: fmt::Arguments<'_>) {
    key.push(':');
    let _ = key.write_fmt(section);
    assert!(key.len() < ROUTE_LEN, "Out of bounds write attempt");
}

/// Builds the route key for `method` and `template`.
///
/// Arguments are consumed segment by segment to stay aligned with the
/// template; only ids following `channels` or `guilds` reach the key.
///
/// # Panics
///
/// On placeholder/argument mismatch, or when the key reaches [`ROUTE_LEN`].
///
/// # Example
///
/// ```rust
/// use winecord::{build_key, Method, RouteArg};
///
/// let a = build_key(Method::Delete, "/channels/%u/messages/%u", &[RouteArg::Id(123), RouteArg::Id(111)]);
/// let b = build_key(Method::Delete, "/channels/%u/messages/%u", &[RouteArg::Id(123), RouteArg::Id(222)]);
/// assert_eq!(a, b);
/// ```
pub fn build_key(method: Method, template: &str, args: &[RouteArg<'_>]) -> String {
    let mut key = String::with_capacity(64);
    let mut args = args.iter();
    let mut prev = "";

    push_section(&mut key, format_args!("{}", method.key_code()));

    // the leading '/' yields an empty first segment
    let path = template.strip_prefix('/').unwrap_or(template);
    for segment in path.split('/') {
        // reactions and everything below share one bucket
        if prev.starts_with("reactions") {
            break;
        }

        let mut id_arg = 0u64;
        let mut chars = segment.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                continue;
            }
            if let RouteArg::Id(id) = check_arg(placeholder_of(chars.next()), args.next()) {
                id_arg = id;
            }
        }

        if segment == "%u" && (prev.starts_with("channels") || prev.starts_with("guilds")) {
            push_section(&mut key, format_args!("{}", id_arg));
        } else {
            push_section(&mut key, format_args!("{}", segment));
        }

        prev = segment;
    }

    key
}
