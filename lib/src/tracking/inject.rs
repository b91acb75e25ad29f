use std::cell::Cell;

use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings};

use super::TrackingLinks;
use crate::Result;

/// Rewrites outbound links to go through the redirect endpoint and appends
/// the open pixel and the read confirmation link.
///
/// Only absolute `http(s)` links are rewritten; `mailto:`, anchors and
/// relative links are left alone, as are links that already point at the
/// redirect endpoint. The appended markup goes right before `</body>`, or at
/// the end of the document for fragments without a body.
pub fn inject(html: &str, links: &TrackingLinks) -> Result<String> {
    if html.is_empty() {
        return Ok(String::new());
    }

    let tail = tail_markup(links);
    let saw_body = Cell::new(false);

    let out = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("a[href]", |el| {
                    if let Some(href) = el.get_attribute("href") {
                        if href.starts_with("http") && !links.is_tracked(&href) {
                            el.set_attribute("href", links.redirect_url(&href).as_str())?;
                        }
                    }
                    Ok(())
                }),
                element!("body", |el| {
                    saw_body.set(true);
                    el.append(&tail, ContentType::Html);
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    if saw_body.get() {
        Ok(out)
    } else {
        Ok(out + &tail)
    }
}

fn tail_markup(links: &TrackingLinks) -> String {
    format!(
        "<img src=\"{}\" alt=\"\" width=\"1\" height=\"1\" style=\"display:none;\" />\
         <p style=\"margin-top:24px\"><a href=\"{}\" target=\"_blank\" rel=\"noopener\">Confirmar lectura</a></p>",
        links.open_url(),
        links.confirm_url()
    )
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::mail::MailId;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    fn links() -> TrackingLinks {
        let base = Url::parse("https://track.example.com").unwrap();
        TrackingLinks::new(&base, MailId::nil(), TOKEN).unwrap()
    }

    #[test]
    fn rewrites_http_links_only() {
        let html = r##"<html><body><a href="http://x.com">x</a> <a href="mailto:a@b.com">m</a> <a href="#top">t</a></body></html>"##;
        let out = inject(html, &links()).unwrap();

        assert!(out.contains("href=\"https://track.example.com/linkRedirect?msg="));
        assert!(out.contains(&format!("u={}", crate::tracking::encode_url("http://x.com"))));
        assert!(out.contains("href=\"mailto:a@b.com\""));
        assert!(out.contains("href=\"#top\""));
        assert!(!out.contains("href=\"http://x.com\""));
    }

    #[test]
    fn already_tracked_links_are_kept() {
        let tracked = links().redirect_url("https://y.com");
        let html = format!(r#"<body><a href="{}">y</a></body>"#, tracked);
        let out = inject(&html, &links()).unwrap();
        assert_eq!(out.matches("linkRedirect").count(), 1);
    }

    #[test]
    fn pixel_and_confirmation_go_before_body_end() {
        let out = inject("<html><body><p>hola</p></body></html>", &links()).unwrap();
        let pixel = out.find("/trackOpen?").unwrap();
        let confirm = out.find("/confirmRead?").unwrap();
        let body_end = out.find("</body>").unwrap();
        assert!(pixel < confirm);
        assert!(confirm < body_end);
        assert!(out.contains("Confirmar lectura"));
    }

    #[test]
    fn fragments_get_the_tail_appended() {
        let out = inject("<a href=\"http://x.com\">x</a>", &links()).unwrap();
        assert!(out.starts_with("<a href=\"https://track.example.com/linkRedirect?"));
        assert!(out.ends_with("Confirmar lectura</a></p>"));
        assert_eq!(out.matches("/trackOpen?").count(), 1);
    }

    #[test]
    fn empty_html_stays_empty() {
        assert_eq!(inject("", &links()).unwrap(), "");
    }
}
