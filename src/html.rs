//! Streaming anchor extraction built on `lol_html`.

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use futures_util::StreamExt;
use lol_html::{element, HtmlRewriter, OutputSink, Settings};
use reqwest::Response;

/// Errors surfaced while streaming an HTML document.
#[derive(Debug)]
pub enum HtmlStreamError {
    /// Reading the response stream failed.
    Http(reqwest::Error),
    /// The tokenizer rejected the markup.
    Rewrite(lol_html::errors::RewritingError),
}

impl fmt::Display for HtmlStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "http stream error: {err}"),
            Self::Rewrite(err) => write!(f, "html rewrite error: {err}"),
        }
    }
}

impl Error for HtmlStreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            Self::Rewrite(err) => Some(err),
        }
    }
}

/// Streams `a[href]` attribute values out of an HTTP response body.
///
/// `transform` runs for every href in document order; returning `Some(T)`
/// keeps the value, `None` skips it. The body is consumed chunk by chunk and
/// never buffered in full. Truncated input simply ends the stream early;
/// malformed markup only fails when the tokenizer itself gives up.
///
/// The rewriter's handlers are not `Send`, so callers run on a local task
/// set.
pub async fn stream_links<T, F>(response: Response, transform: F) -> Result<Vec<T>, HtmlStreamError>
where
    F: Fn(&str) -> Option<T> + 'static,
    T: 'static,
{
    let links: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
    let collected = Rc::clone(&links);

    let handler = element!("a[href]", move |anchor| {
        if let Some(href) = anchor.get_attribute("href") {
            if let Some(mapped) = transform(&href) {
                collected.borrow_mut().push(mapped);
            }
        }
        Ok(())
    });

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![handler],
            ..Settings::default()
        },
        DiscardSink,
    );

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(HtmlStreamError::Http)?;
        rewriter.write(&chunk).map_err(HtmlStreamError::Rewrite)?;
    }
    rewriter.end().map_err(HtmlStreamError::Rewrite)?;

    Ok(links.take())
}

struct DiscardSink;

impl OutputSink for DiscardSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}
