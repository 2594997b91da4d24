use std::collections::BTreeMap;

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::{Captures, Regex};
use url::Url;

use entity::campaign;
use entity::subscriber;

use crate::signing;

/// A fully rendered, per-recipient message ready to hand to a
/// [`crate::connection::Transport`] (C5).
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub from_header: String,
    pub reply_to_header: Option<String>,
    pub to: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

static LEGACY_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([A-Za-z0-9_]+)\]").unwrap());
static CLOSING_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body>").unwrap());
static HTML_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(<a\s[^>]*?href\s*=\s*)"(https?://[^"]*)""#).unwrap());

/// Translates the legacy `[NAME]` placeholder syntax to `{{ NAME }}`
/// before handlebars ever sees the template (§4.5 step 2).
fn translate_legacy_markers(template: &str) -> String {
    LEGACY_MARKER.replace_all(template, "{{ $1 }}").into_owned()
}

fn render_body(reg: &Handlebars, template: &str, context: &BTreeMap<String, String>) -> String {
    if template.is_empty() {
        return String::new();
    }

    let translated = translate_legacy_markers(template);
    reg.render_template(&translated, context).unwrap_or(translated)
}

/// Inserts the open-tracking pixel immediately before the first
/// `</body>` (case-insensitive); appended to the end if no `</body>`
/// is present at all (§4.5 step 3).
fn insert_tracking_pixel(html: &str, public_url: &str, tracking_id: &str) -> String {
    let pixel = format!(r#"<img src="{public_url}/open/{tracking_id}" width="1" height="1" alt="nt">"#);

    if let Some(m) = CLOSING_BODY.find(html) {
        let mut out = String::with_capacity(html.len() + pixel.len());
        out.push_str(&html[..m.start()]);
        out.push_str(&pixel);
        out.push_str(&html[m.start()..]);
        out
    } else {
        format!("{html}{pixel}")
    }
}

/// Augments a link target with `utm_content`/`utm_term`, preserving any
/// query key the template author already set (defaults-only merge),
/// then signs it and builds the `/link/...` redirect URL (§4.5 step 4).
fn rewrite_link(target: &str, campaign: &campaign::Model, tracking_id: &str, public_url: &str, index: usize) -> Option<String> {
    let mut url = Url::parse(target).ok()?;

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if !pairs.iter().any(|(k, _)| k == "utm_content") {
        pairs.push(("utm_content".to_string(), format!("link-{index}")));
    }
    if !pairs.iter().any(|(k, _)| k == "utm_term") {
        pairs.push(("utm_term".to_string(), String::new()));
    }

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
    }

    let mut augmented = url.to_string();

    // `Url` normalizes a bare authority ("http://e.com") to an explicit
    // root path ("http://e.com/"); undo that when the original target had
    // no path of its own, so the signed/rendered target stays bit-exact
    // with what was written in the template.
    let before_query = target.split(['?', '#']).next().unwrap_or(target);
    let has_explicit_path = before_query.splitn(2, "://").nth(1).map(|rest| rest.contains('/')).unwrap_or(false);
    if !has_explicit_path {
        augmented = augmented.replacen("/?", "?", 1);
    }

    let signature = signing::sign(&campaign.signature_key, &augmented);
    let encoded = utf8_percent_encode(&augmented, NON_ALPHANUMERIC).to_string();

    Some(format!("{public_url}/link/{tracking_id}/{signature}/{encoded}"))
}

fn rewrite_links(html: &str, campaign: &campaign::Model, tracking_id: &str, public_url: &str) -> String {
    let mut index = 0usize;

    HTML_LINK
        .replace_all(html, |caps: &Captures| {
            let prefix = &caps[1];
            let target = &caps[2];

            match rewrite_link(target, campaign, tracking_id, public_url, index) {
                Some(rewritten) => {
                    index += 1;
                    format!(r#"{prefix}"{rewritten}""#)
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Builds the per-recipient message for a given (campaign, subscriber,
/// tracking_id) triple (C5). Pure: two calls with the same inputs
/// produce the same output.
pub fn render(campaign: &campaign::Model, subscriber: &subscriber::Model, tracking_id: &str, public_url: &str) -> RenderedMessage {
    let mut context = subscriber.template_context();
    context.insert("tracking_id".to_string(), tracking_id.to_string());

    let reg = Handlebars::new();

    let text_rendered = render_body(&reg, &campaign.text_body, &context);
    let html_rendered = render_body(&reg, &campaign.html_body, &context);

    let html_body = if html_rendered.is_empty() {
        None
    } else {
        let with_pixel = insert_tracking_pixel(&html_rendered, public_url, tracking_id);
        Some(rewrite_links(&with_pixel, campaign, tracking_id, public_url))
    };

    let text_body = if text_rendered.is_empty() { None } else { Some(text_rendered) };

    RenderedMessage {
        from_header: campaign.from_header(),
        reply_to_header: campaign.reply_to_header(),
        to: subscriber.email.clone(),
        subject: campaign.subject.clone(),
        html_body,
        text_body,
    }
}

/// Applies the click-redirect UTM augmentation (§4.9): `utm_source`
/// and `utm_medium` always win over whatever the target already has,
/// `utm_campaign` only fills in if absent.
pub fn augment_redirect_target(decoded: &str, campaign_utm_name: &str) -> String {
    let Ok(mut url) = Url::parse(decoded) else {
        return decoded.to_string();
    };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| k != "utm_source" && k != "utm_medium")
        .collect();

    if !pairs.iter().any(|(k, _)| k == "utm_campaign") {
        pairs.push(("utm_campaign".to_string(), campaign_utm_name.to_string()));
    }

    pairs.push(("utm_source".to_string(), "nuntius".to_string()));
    pairs.push(("utm_medium".to_string(), "email".to_string()));

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
    }

    url.to_string()
}
