//! HTML to Markdown conversion: ATX headings, fenced code, `-` bullets.

use scraper::{ElementRef, Node};

/// Convert an element subtree to markdown. Non-content elements (scripts,
/// styles, navigation chrome) are dropped.
pub fn element_to_markdown(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    walk(element, &mut out, &ListContext::None);
    collapse_blank_lines(&out)
}

enum ListContext {
    None,
    Unordered,
    Ordered(std::cell::Cell<usize>),
}

fn walk(element: ElementRef<'_>, out: &mut String, list: &ListContext) {
    let tag = element.value().name();

    match tag {
        "script" | "style" | "noscript" | "nav" | "footer" | "aside" | "iframe" | "svg"
        | "form" | "button" => return,
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag.as_bytes()[1] - b'0';
            ensure_blank_line(out);
            out.push_str(&"#".repeat(level as usize));
            out.push(' ');
            push_inline_text(element, out);
            out.push_str("\n\n");
            return;
        }
        "p" => {
            ensure_blank_line(out);
            walk_children(element, out, list);
            out.push_str("\n\n");
            return;
        }
        "br" => {
            out.push('\n');
            return;
        }
        "pre" => {
            ensure_blank_line(out);
            out.push_str("```\n");
            let code: String = element.text().collect();
            out.push_str(code.trim_end());
            out.push_str("\n```\n\n");
            return;
        }
        "code" => {
            out.push('`');
            push_inline_text(element, out);
            out.push('`');
            return;
        }
        "ul" => {
            ensure_blank_line(out);
            walk_children(element, out, &ListContext::Unordered);
            out.push('\n');
            return;
        }
        "ol" => {
            ensure_blank_line(out);
            walk_children(element, out, &ListContext::Ordered(std::cell::Cell::new(0)));
            out.push('\n');
            return;
        }
        "li" => {
            match list {
                ListContext::Ordered(counter) => {
                    counter.set(counter.get() + 1);
                    out.push_str(&format!("{}. ", counter.get()));
                }
                _ => out.push_str("- "),
            }
            walk_children(element, out, &ListContext::None);
            out.push('\n');
            return;
        }
        "a" => {
            let href = element.value().attr("href").unwrap_or("");
            if href.starts_with("http") {
                out.push('[');
                push_inline_text(element, out);
                out.push_str(&format!("]({})", href));
            } else {
                push_inline_text(element, out);
            }
            return;
        }
        "strong" | "b" => {
            out.push_str("**");
            push_inline_text(element, out);
            out.push_str("**");
            return;
        }
        "em" | "i" => {
            out.push('*');
            push_inline_text(element, out);
            out.push('*');
            return;
        }
        "blockquote" => {
            ensure_blank_line(out);
            let mut inner = String::new();
            walk_children(element, &mut inner, list);
            for line in inner.trim().lines() {
                out.push_str("> ");
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
            return;
        }
        "tr" => {
            let cells: Vec<String> = element
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| matches!(c.value().name(), "td" | "th"))
                .map(|c| inline_text(c))
                .collect();
            if !cells.is_empty() {
                out.push_str("| ");
                out.push_str(&cells.join(" | "));
                out.push_str(" |\n");
            }
            return;
        }
        "div" | "section" | "article" | "main" | "table" | "tbody" | "thead" | "body"
        | "span" | "figure" | "figcaption" | "header" => {}
        _ => {}
    }

    walk_children(element, out, list);
    if matches!(tag, "div" | "section" | "article" | "table") {
        ensure_blank_line(out);
    }
}

fn walk_children(element: ElementRef<'_>, out: &mut String, list: &ListContext) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_text(out, text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    walk(child_el, out, list);
                }
            }
            _ => {}
        }
    }
}

fn push_text(out: &mut String, text: &str) {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push_str(&collapsed);
}

fn push_inline_text(element: ElementRef<'_>, out: &mut String) {
    let text = inline_text(element);
    out.push_str(&text);
}

fn inline_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn ensure_blank_line(out: &mut String) {
    if out.is_empty() {
        return;
    }
    while out.ends_with(' ') {
        out.pop();
    }
    if !out.ends_with("\n\n") {
        if out.ends_with('\n') {
            out.push('\n');
        } else {
            out.push_str("\n\n");
        }
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blanks = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks <= 1 {
                out.push('\n');
            }
        } else {
            blanks = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_string()
}
