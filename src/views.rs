use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use chrono::{TimeZone, Utc};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use verification_keys::{
    ApiKeysContext, AuthorizedApp, Realm, User,
    apikeys::{API_KEYS_PATH, API_KEYS_VIEW, REALM_SELECT_PATH, SIGNOUT_PATH},
    session::{CsrfField, FlashMessage},
};

const BASE_STYLES: &str = r#"
  :root {
    color-scheme: light dark;
    font-family: 'Inter', -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
  }

  body {
    margin: 0;
    background: #f5f6fb;
    color: #1f2937;
  }

  @media (prefers-color-scheme: dark) {
    body {
      background: #0f172a;
      color: #e2e8f0;
    }
  }

  header.topbar {
    display: flex;
    align-items: center;
    justify-content: space-between;
    padding: 16px 32px;
    border-bottom: 1px solid rgba(15, 23, 42, 0.08);
  }

  header.topbar nav a {
    margin-left: 16px;
  }

  main {
    max-width: 960px;
    margin: 32px auto;
    padding: 0 24px;
  }

  .flash {
    padding: 12px 16px;
    margin-bottom: 12px;
    border-radius: 10px;
  }

  .flash-error {
    background: rgba(220, 38, 38, 0.12);
    color: #b91c1c;
  }

  .flash-warning {
    background: rgba(234, 179, 8, 0.14);
    color: #a16207;
  }

  .flash-alert {
    background: rgba(34, 197, 94, 0.14);
    color: #15803d;
  }

  table {
    width: 100%;
    border-collapse: collapse;
    margin-bottom: 32px;
  }

  th, td {
    text-align: left;
    padding: 8px 12px;
    border-bottom: 1px solid rgba(15, 23, 42, 0.08);
  }

  td.count {
    text-align: right;
    font-variant-numeric: tabular-nums;
  }

  .muted {
    color: rgba(100, 116, 139, 0.95);
  }
"#;

/// Page-specific data for the realm picker.
#[derive(Debug, Clone)]
pub struct RealmSelectContext {
    pub user: User,
    pub realms: Vec<Realm>,
    pub current_realm_id: Option<i64>,
    pub flash: Vec<FlashMessage>,
    pub csrf: CsrfField,
}

#[derive(Debug, Clone)]
pub struct SignedOutContext {
    pub flash: Vec<FlashMessage>,
}

#[derive(Debug)]
pub enum View {
    ApiKeys(Box<ApiKeysContext>),
    RealmSelect(RealmSelectContext),
    SignedOut(SignedOutContext),
}

impl View {
    pub fn name(&self) -> &'static str {
        match self {
            View::ApiKeys(_) => API_KEYS_VIEW,
            View::RealmSelect(_) => "realm",
            View::SignedOut(_) => "signout",
        }
    }
}

pub fn render_html(view: &View) -> Response {
    tracing::debug!(view = view.name(), "rendering view");
    let html = match view {
        View::ApiKeys(ctx) => api_keys_page(ctx),
        View::RealmSelect(ctx) => realm_select_page(ctx),
        View::SignedOut(ctx) => signed_out_page(ctx),
    };
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

fn layout(title: &str, topbar: &str, csrf: Option<&CsrfField>, body: &str) -> String {
    let csrf_meta = csrf
        .map(|field| {
            format!(
                "<meta name=\"csrf-token\" content=\"{}\" />\n    ",
                attr(&field.value)
            )
        })
        .unwrap_or_default();
    format!(
        "<!doctype html>\n<html lang=\"en\">\n  <head>\n    <meta charset=\"UTF-8\" />\n    <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />\n    {}<title>{}</title>\n    <style>{}</style>\n  </head>\n  <body>\n    {}\n    <main role=\"main\">\n{}\n    </main>\n  </body>\n</html>",
        csrf_meta,
        text(title),
        BASE_STYLES,
        topbar,
        body
    )
}

fn topbar(user: &User, realm: Option<&Realm>) -> String {
    let realm_label = realm
        .map(|realm| format!("<strong>{}</strong>", text(&realm.name)))
        .unwrap_or_else(|| "<span class=\"muted\">No realm selected</span>".to_owned());
    format!(
        "<header class=\"topbar\"><div>{}</div><nav><span>{}</span><a href=\"{}\">API keys</a><a href=\"{}\">Switch realm</a><a href=\"{}\">Sign out</a></nav></header>",
        realm_label,
        text(user.display_name()),
        API_KEYS_PATH,
        REALM_SELECT_PATH,
        SIGNOUT_PATH
    )
}

fn flash_banner(messages: &[FlashMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!(
            "      <div class=\"flash flash-{}\" role=\"alert\">{}</div>\n",
            msg.level.as_str(),
            text(&msg.message)
        ));
    }
    out
}

fn api_keys_page(ctx: &ApiKeysContext) -> String {
    let (disabled, active): (Vec<&AuthorizedApp>, Vec<&AuthorizedApp>) =
        ctx.apps.iter().partition(|app| app.is_disabled());

    let mut body = flash_banner(&ctx.flash);
    body.push_str("      <h1>API keys</h1>\n");
    if active.is_empty() {
        body.push_str("      <p class=\"muted\">There are no API keys in this realm yet.</p>\n");
    } else {
        body.push_str(&apps_table(ctx, &active));
    }
    if !disabled.is_empty() {
        body.push_str("      <h2>Disabled API keys</h2>\n");
        body.push_str(&apps_table(ctx, &disabled));
    }

    layout(
        &format!("API keys · {}", ctx.realm.name),
        &topbar(&ctx.user, Some(&ctx.realm)),
        Some(&ctx.csrf),
        &body,
    )
}

fn apps_table(ctx: &ApiKeysContext, apps: &[&AuthorizedApp]) -> String {
    let mut table = String::from(
        "      <table>\n        <thead><tr><th>Name</th><th>Type</th><th>Key</th><th>Created</th><th>Codes 1d</th><th>Codes 7d</th><th>Codes 30d</th></tr></thead>\n        <tbody>\n",
    );
    for app in apps {
        let usage = ctx.usage.summary_for(app.id);
        let kind = if app.api_key_type == ctx.type_admin {
            ctx.type_admin.label()
        } else {
            ctx.type_device.label()
        };
        table.push_str(&format!(
            "          <tr data-app-id=\"{}\"><td>{}</td><td>{}</td><td><code>{}…</code></td><td>{}</td><td class=\"count\">{}</td><td class=\"count\">{}</td><td class=\"count\">{}</td></tr>\n",
            app.id,
            text(&app.name),
            kind,
            text(&app.api_key_preview),
            format_date(app.created_at),
            usage.codes_issued_1d,
            usage.codes_issued_7d,
            usage.codes_issued_30d
        ));
    }
    table.push_str("        </tbody>\n      </table>\n");
    table
}

fn realm_select_page(ctx: &RealmSelectContext) -> String {
    let mut body = flash_banner(&ctx.flash);
    body.push_str("      <h1>Select a realm</h1>\n");
    if ctx.realms.is_empty() {
        body.push_str(
            "      <p class=\"muted\">You are not a member of any realm. Ask an administrator for access.</p>\n",
        );
    } else {
        body.push_str(&format!(
            "      <form method=\"post\" action=\"{}\">\n        {}\n        <select name=\"realm_id\">\n",
            REALM_SELECT_PATH,
            ctx.csrf.hidden_input()
        ));
        for realm in &ctx.realms {
            let selected = if ctx.current_realm_id == Some(realm.id) {
                " selected"
            } else {
                ""
            };
            body.push_str(&format!(
                "          <option value=\"{}\"{}>{}</option>\n",
                realm.id,
                selected,
                text(&realm.name)
            ));
        }
        body.push_str(
            "        </select>\n        <button type=\"submit\">Continue</button>\n      </form>\n",
        );
    }

    layout("Select a realm", &topbar(&ctx.user, None), Some(&ctx.csrf), &body)
}

fn signed_out_page(ctx: &SignedOutContext) -> String {
    let mut body = flash_banner(&ctx.flash);
    body.push_str(
        "      <h1>Signed out</h1>\n      <p class=\"muted\">Sign in through your identity provider to manage API keys.</p>\n",
    );
    layout("Signed out", "", None, &body)
}

fn format_date(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}
