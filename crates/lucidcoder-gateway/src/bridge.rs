//! Script injected into proxied HTML so the host page can talk to the
//! preview iframe.

use axum::http::{header, HeaderMap};

pub const BRIDGE_MARKER: &str = "data-lucidcoder-bridge";

const BRIDGE_BODY: &str = r#"(function () {
  if (window.parent === window || window.__lucidcoderBridge) return;
  var post = function (type, payload) {
    try {
      window.parent.postMessage(Object.assign({ source: "lucidcoder-preview", type: type, projectId: projectId }, payload || {}), "*");
    } catch (e) {}
  };
  var notify = function () {
    post("lucidcoder:navigated", { href: window.location.href, path: window.location.pathname, base: base, title: document.title });
  };
  window.__lucidcoderBridge = {
    base: base,
    projectId: projectId,
    notifyNavigation: notify,
    openContextMenu: function (x, y, detail) { post("lucidcoder:context-menu", { x: x, y: y, detail: detail || null }); }
  };
  ["pushState", "replaceState"].forEach(function (name) {
    var original = history[name];
    history[name] = function () {
      var result = original.apply(this, arguments);
      notify();
      return result;
    };
  });
  window.addEventListener("popstate", notify);
  window.addEventListener("hashchange", notify);
  window.addEventListener("contextmenu", function (event) {
    if (event.shiftKey) return;
    event.preventDefault();
    window.__lucidcoderBridge.openContextMenu(event.clientX, event.clientY, { tag: event.target && event.target.tagName });
  });
  window.addEventListener("message", function (event) {
    var data = event.data || {};
    if (data.type === "lucidcoder:ping") post("lucidcoder:pong", { nonce: data.nonce });
  });
  var ready = function () { post("lucidcoder:ready"); notify(); };
  if (document.readyState === "loading") {
    document.addEventListener("DOMContentLoaded", ready);
  } else {
    ready();
  }
})();"#;

/// A JS string literal that cannot terminate the surrounding `<script>`.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

pub fn bridge_script(project_id: &str) -> String {
    let base = format!("/preview/{}", urlencoding::encode(project_id));
    format!(
        "<script {BRIDGE_MARKER}>var base = {}, projectId = {};\n{BRIDGE_BODY}</script>",
        js_string(&base),
        js_string(project_id),
    )
}

fn find_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Inserts the bridge right before `</head>`, or prepends it when the
/// document has no head. Works on raw bytes so pages in any
/// ASCII-compatible charset pass through intact.
pub fn inject_bridge(html: &[u8], project_id: &str) -> Vec<u8> {
    if find_ascii_case_insensitive(html, BRIDGE_MARKER.as_bytes()).is_some() {
        return html.to_vec();
    }
    let script = bridge_script(project_id);
    let index = find_ascii_case_insensitive(html, b"</head>").unwrap_or(0);
    let mut output = Vec::with_capacity(html.len() + script.len());
    output.extend_from_slice(&html[..index]);
    output.extend_from_slice(script.as_bytes());
    output.extend_from_slice(&html[index..]);
    output
}

pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

pub fn strip_csp(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_SECURITY_POLICY);
    headers.remove(header::CONTENT_SECURITY_POLICY_REPORT_ONLY);
}
