use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn selector(source_id: &str, css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css)
        .map_err(|e| AdapterError::format_change(source_id, format!("bad selector {css}: {e}")))
}

/// First selector in `candidates` that matches anything in `document`.
pub(crate) fn first_matching<'a>(
    source_id: &str,
    document: &Html,
    candidates: &'a [&'a str],
) -> Result<Option<Selector>, AdapterError> {
    for css in candidates {
        let sel = selector(source_id, css)?;
        if document.select(&sel).next().is_some() {
            return Ok(Some(sel));
        }
    }
    Ok(None)
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn select_first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).next().and_then(element_text)
}

pub(crate) fn select_first_attr(element: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}
