//! Page templates and per-tenant styling
//!
//! Templates are plain HTML bodies with named placeholders. Rendering is
//! two substitution passes over `{public_url}` and `{style_block}`;
//! placeholders the renderer does not know are left intact.

use serde::{Deserialize, Serialize};

/// A named HTML fragment owned by one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub body: String,
}

/// Five-color palette interpolated into the style block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    #[serde(default = "default_body_bg")]
    pub body_bg: String,
    #[serde(default = "default_body_text")]
    pub body_text: String,
    #[serde(default = "default_h1")]
    pub h1: String,
    #[serde(default = "default_btn")]
    pub btn: String,
    #[serde(default = "default_btn_text")]
    pub btn_text: String,
}

fn default_body_bg() -> String {
    "#f5f5f5".to_string()
}

fn default_body_text() -> String {
    "#333".to_string()
}

fn default_h1() -> String {
    "#444".to_string()
}

fn default_btn() -> String {
    "#becdc3".to_string()
}

fn default_btn_text() -> String {
    "#000".to_string()
}

impl Default for Style {
    fn default() -> Self {
        Self {
            body_bg: default_body_bg(),
            body_text: default_body_text(),
            h1: default_h1(),
            btn: default_btn(),
            btn_text: default_btn_text(),
        }
    }
}

/// Minimal stylesheet applied to every rendered page
const STYLE_SHEET: &str = r#"
<style>
  body{font-family:Arial,Helvetica,sans-serif;font-size:16px;line-height:1.5;margin:0;padding:0;background-color:{body_bg};color:{body_text};}
  h1{font-size:2rem;margin-bottom:1rem;color:{h1};}
  label{margin-bottom:0.5rem;}input{padding:0.5rem;margin-bottom:1rem;border-radius:0.25rem;border:1px solid #ccc;}
  table{border-collapse:collapse;}
  th,td{padding:0.5rem;}
  tr{border-bottom: 1px solid #ddd;}
  tr:nth-child(even){background-color: #D6EEEE;}
  button{padding:0.5rem 1rem;background-color:{btn};color:{btn_text};border:none;border-radius:0.25rem;cursor:pointer;}
</style>"#;

/// Built-in welcome page with an htmx poller against the tenant's
/// `/runtime` endpoint. Available to configs and tests; tenants without
/// an `index` template do NOT get it implicitly.
pub const SPLASH_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>w e l c o m e</title>
  <script src="https://unpkg.com/htmx.org@1.9.6" integrity="sha384-FhXw7b6AlE/jyjlZH5iHa/tTe9EpJ1Y55RjcgPbjeWMskSxZt1v9qkxLJWNJaGni" crossorigin="anonymous"></script>
</head>
<body>
  <h1>thanks for visiting!</h1>
  <div id="runtime" hx-trigger="every 2s" hx-get="{public_url}/runtime">runtime stats</div>
  <div class="target" id="target"></div>
  <div id="content"><hr><br /><h2>this is it</h2></div>
  <div id="guests"></div>
  {style_block}
</body>
</html>"#;

/// Interpolate the palette into the stylesheet
pub fn render_style_block(style: &Style) -> String {
    STYLE_SHEET
        .replace("{body_bg}", &style.body_bg)
        .replace("{body_text}", &style.body_text)
        .replace("{h1}", &style.h1)
        .replace("{btn}", &style.btn)
        .replace("{btn_text}", &style.btn_text)
}

/// Substitute the named placeholders into a template body
pub fn render_page(template_body: &str, public_url: &str, style_block: &str) -> String {
    template_body
        .replace("{public_url}", public_url)
        .replace("{style_block}", style_block)
}

/// Look up a template by name; the last registration wins
pub fn find_template<'a>(templates: &'a [Template], name: &str) -> Option<&'a str> {
    templates
        .iter()
        .rev()
        .find(|t| t.name == name)
        .map(|t| t.body.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_page_substitutes_named_placeholders() {
        let body = "hello {public_url} {style_block}";
        let out = render_page(body, "http://about.example.com:8080", "<style></style>");
        assert_eq!(
            out,
            "hello http://about.example.com:8080 <style></style>"
        );
    }

    #[test]
    fn test_render_page_leaves_unknown_placeholders() {
        let out = render_page("{public_url} {guestbook}", "http://x", "");
        assert_eq!(out, "http://x {guestbook}");
    }

    #[test]
    fn test_render_page_replaces_every_occurrence() {
        let out = render_page("{public_url}/a {public_url}/b", "http://x", "");
        assert_eq!(out, "http://x/a http://x/b");
    }

    #[test]
    fn test_style_block_interpolates_palette() {
        let style = Style {
            body_bg: "#111".to_string(),
            body_text: "#222".to_string(),
            h1: "#333".to_string(),
            btn: "#444".to_string(),
            btn_text: "#555".to_string(),
        };
        let block = render_style_block(&style);

        assert!(block.starts_with('\n'));
        assert!(block.contains("background-color:#111;color:#222;"));
        assert!(block.contains("h1{font-size:2rem;margin-bottom:1rem;color:#333;}"));
        assert!(block.contains("background-color:#444;color:#555;"));
        assert!(!block.contains("{body_bg}"));
    }

    #[test]
    fn test_find_template_last_wins() {
        let templates = vec![
            Template {
                name: "index".to_string(),
                body: "first".to_string(),
            },
            Template {
                name: "index".to_string(),
                body: "second".to_string(),
            },
        ];
        assert_eq!(find_template(&templates, "index"), Some("second"));
        assert_eq!(find_template(&templates, "missing"), None);
    }

    #[test]
    fn test_splash_page_wires_runtime_poller() {
        let rendered = render_page(
            SPLASH_PAGE,
            "http://blog.example.com:8080",
            "<style>b{}</style>",
        );
        assert!(rendered.contains("hx-get=\"http://blog.example.com:8080/runtime\""));
        assert!(rendered.contains("<style>b{}</style>"));
        assert!(!rendered.contains("{public_url}"));
    }
}
