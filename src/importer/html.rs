//! Streaming HTML rewriting helpers shared by the pipeline stages.

use std::borrow::Cow;

use lol_html::{element, ElementContentHandlers, HtmlRewriter, Selector, Settings};

use crate::constants::IMAGE_PLACEHOLDER_PREFIX;

/// Run `html` through a rewriter with the given element handlers.
///
/// # Errors
///
/// Returns a description of the failure if rewriting fails or produces
/// invalid UTF-8.
pub fn rewrite_html<'h>(
    html: &str,
    handlers: Vec<(Cow<'h, Selector>, ElementContentHandlers<'h>)>,
) -> Result<String, String> {
    let mut output = Vec::with_capacity(html.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| format!("HTML rewrite error: {e}"))?;
    rewriter
        .end()
        .map_err(|e| format!("HTML rewrite finalization error: {e}"))?;

    String::from_utf8(output).map_err(|e| format!("invalid UTF-8 in rewritten HTML: {e}"))
}

/// Placeholder `src` for the image at `index`.
#[must_use]
pub fn image_placeholder(index: usize) -> String {
    format!("{IMAGE_PLACEHOLDER_PREFIX}{index}")
}

/// Index encoded in a placeholder `src`, if it is one.
#[must_use]
pub fn placeholder_index(src: &str) -> Option<usize> {
    src.strip_prefix(IMAGE_PLACEHOLDER_PREFIX)?.parse().ok()
}

/// Replace every placeholder image `src` with `resolve(index)`.
///
/// Images for which `resolve` returns `None` are removed from the markup.
///
/// # Errors
///
/// Returns a description of the failure if rewriting fails.
pub fn rewrite_image_placeholders<F>(html: &str, resolve: F) -> Result<String, String>
where
    F: Fn(usize) -> Option<String>,
{
    let selector = format!("img[src^=\"{IMAGE_PLACEHOLDER_PREFIX}\"]");

    rewrite_html(
        html,
        vec![element!(selector, |el| {
            let target = el
                .get_attribute("src")
                .as_deref()
                .and_then(placeholder_index)
                .and_then(&resolve);
            match target {
                Some(src) => el.set_attribute("src", &src)?,
                None => el.remove(),
            }
            Ok(())
        })],
    )
}
