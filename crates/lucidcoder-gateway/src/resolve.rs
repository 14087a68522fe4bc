//! Request classification.
//!
//! Each predicate inspects a [`RequestView`] and either claims the request
//! for a project, claims it for the host application, or abstains. They are
//! evaluated in [`PREDICATES`] order and the first opinion wins.

use axum::http::{header, HeaderMap, HeaderValue};

pub const PREVIEW_COOKIE: &str = "lucidcoder_preview_project";
pub const PREVIEW_PREFIX: &str = "/preview/";

const DEV_ASSET_PREFIXES: &[&str] = &[
    "/src/",
    "/@vite/client",
    "/@vite/",
    "/node_modules/",
    "/@fs/",
    "/@id/",
    "/@react-refresh",
    "/uploads/",
];

const HOST_PREFIXES: &[&str] = &["/api", "/__debug"];

/// The parts of a request the predicates look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub cookie_project: Option<&'a str>,
}

impl<'a> RequestView<'a> {
    fn path_and_query(&self) -> String {
        match self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.to_string(),
        }
    }

    fn header(&self, name: header::HeaderName) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    PreviewPath,
    CookieAsset,
    ViteHmr,
    Referer,
    IframeNavigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub project_id: String,
    /// Path and query sent upstream.
    pub forward_path: String,
    pub resolved_by: ResolvedBy,
}

impl Resolution {
    /// Explicit preview paths pin the project for follow-up asset requests.
    pub fn sets_cookie(&self) -> bool {
        self.resolved_by == ResolvedBy::PreviewPath
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Belongs to the host application; never proxied.
    Host,
    Preview(Resolution),
    Abstain,
}

pub type Predicate = fn(&RequestView<'_>) -> Decision;

pub const PREDICATES: &[(&str, Predicate)] = &[
    ("host_routes", host_routes),
    ("preview_path", preview_path),
    ("cookie_asset", cookie_asset),
    ("vite_hmr", vite_hmr),
    ("iframe_navigation", iframe_navigation),
];

pub fn resolve(view: &RequestView<'_>) -> Option<Resolution> {
    for (name, predicate) in PREDICATES {
        match predicate(view) {
            Decision::Host => return None,
            Decision::Preview(resolution) => {
                tracing::trace!(predicate = name, project_id = %resolution.project_id, "resolved preview request");
                return Some(resolution);
            }
            Decision::Abstain => {}
        }
    }
    None
}

fn has_prefix_segment(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
}

pub fn host_routes(view: &RequestView<'_>) -> Decision {
    if HOST_PREFIXES
        .iter()
        .any(|prefix| has_prefix_segment(view.path, prefix))
    {
        Decision::Host
    } else {
        Decision::Abstain
    }
}

/// Splits `/preview/<id>/<rest>` into the decoded id and `/<rest>`.
pub fn split_preview_path(path: &str) -> Option<(String, String)> {
    let tail = path.strip_prefix(PREVIEW_PREFIX)?;
    let (raw_id, rest) = match tail.find('/') {
        Some(index) => tail.split_at(index),
        None => (tail, ""),
    };
    let id = urlencoding::decode(raw_id).ok()?.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let rest = if rest.is_empty() { "/" } else { rest };
    Some((id, rest.to_string()))
}

pub fn preview_path(view: &RequestView<'_>) -> Decision {
    let Some((project_id, rest)) = split_preview_path(view.path) else {
        return Decision::Abstain;
    };
    let forward_path = match view.query {
        Some(query) if !query.is_empty() => format!("{rest}?{query}"),
        _ => rest,
    };
    Decision::Preview(Resolution {
        project_id,
        forward_path,
        resolved_by: ResolvedBy::PreviewPath,
    })
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn from_cookie(view: &RequestView<'_>, resolved_by: ResolvedBy) -> Decision {
    match view.cookie_project {
        Some(project_id) => Decision::Preview(Resolution {
            project_id: project_id.to_string(),
            forward_path: view.path_and_query(),
            resolved_by,
        }),
        None => Decision::Abstain,
    }
}

pub fn cookie_asset(view: &RequestView<'_>) -> Decision {
    let dev_asset = DEV_ASSET_PREFIXES
        .iter()
        .any(|prefix| view.path.starts_with(prefix));
    if dev_asset || is_websocket_upgrade(view.headers) {
        from_cookie(view, ResolvedBy::CookieAsset)
    } else {
        Decision::Abstain
    }
}

pub fn vite_hmr(view: &RequestView<'_>) -> Decision {
    let hmr_protocol = view
        .header(header::SEC_WEBSOCKET_PROTOCOL)
        .is_some_and(|value| value.split(',').any(|p| p.trim() == "vite-hmr"));
    let token_query = view
        .query
        .is_some_and(|query| query.split('&').any(|pair| pair.split('=').next() == Some("token")));
    if hmr_protocol || token_query {
        from_cookie(view, ResolvedBy::ViteHmr)
    } else {
        Decision::Abstain
    }
}

/// Project id from a referer URL pointing into `/preview/<id>/`.
pub fn referer_project(referer: &str) -> Option<String> {
    let start = referer.find(PREVIEW_PREFIX)?;
    let (id, _) = split_preview_path(&referer[start..])?;
    Some(id)
}

/// Only applies once a preview has set the cookie; the referer then names
/// the project more precisely than the cookie does.
pub fn iframe_navigation(view: &RequestView<'_>) -> Decision {
    if view.cookie_project.is_none() {
        return Decision::Abstain;
    }
    if let Some(project_id) = view.header(header::REFERER).and_then(referer_project) {
        return Decision::Preview(Resolution {
            project_id,
            forward_path: view.path_and_query(),
            resolved_by: ResolvedBy::Referer,
        });
    }
    let iframe = view
        .headers
        .get("sec-fetch-dest")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("iframe"));
    if iframe {
        from_cookie(view, ResolvedBy::IframeNavigation)
    } else {
        Decision::Abstain
    }
}

/// The preview project named by the request cookies, URL-decoded.
pub fn preview_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == PREVIEW_COOKIE)
        .and_then(|(_, value)| urlencoding::decode(value.trim()).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn preview_cookie_header(project_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{PREVIEW_COOKIE}={}; Path=/; SameSite=Lax; HttpOnly",
        urlencoding::encode(project_id)
    ))
    .ok()
}
