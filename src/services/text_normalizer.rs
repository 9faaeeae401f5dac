/// Text Normalizer
///
/// Turns chapter HTML into plain text a synthesizer can speak. The pipeline
/// runs in a fixed order: tag stripping, footnote cleanup, user
/// search/replace rules, newline rewriting, whitespace collapse. Title
/// heuristics live here too since they read both the markup and the
/// normalized text.
use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::config::{NewlineMode, NormalizationConfig, SearchReplaceRule, TitleMode};
use crate::error::{ConversionError, Result};
use crate::models::Chapter;
use crate::utils::sanitize_component;

/// Placeholder keeping inserted break strings safe from the whitespace
/// collapse pass.
const BREAK_MARK: char = '\u{E000}';

const TITLE_PLACEHOLDER: &str = "<blank>";

/// Superscript footnote references: a short digit run right after closing
/// punctuation, with nothing but whitespace in between.
static SUPERSCRIPT_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([.!?,;:)\]»"'”’])\s*\d{1,3}\b"#).unwrap());

/// Bracketed references such as `[3]` or `[3.1]`.
static BRACKET_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+(\.\d+)*\]").unwrap());

static NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").unwrap());
static DOUBLE_NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// User search/replace rules compiled once per conversion. A rule that does
/// not compile fails the whole run with `NormalizationFailed`.
#[derive(Debug)]
pub struct CompiledRules {
    rules: Vec<(Regex, String)>,
}

impl CompiledRules {
    pub fn compile(rules: &[SearchReplaceRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = RegexBuilder::new(&rule.pattern)
                .case_insensitive(rule.case_insensitive)
                .build()
                .map_err(|e| {
                    ConversionError::NormalizationFailed(format!(
                        "invalid rule pattern {:?}: {e}",
                        rule.pattern
                    ))
                })?;
            compiled.push((regex, rule.replacement.clone()));
        }
        Ok(CompiledRules { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for (regex, replacement) in &self.rules {
            current = regex.replace_all(&current, replacement.as_str()).into_owned();
        }
        current
    }
}

/// Full pipeline: chapter HTML to speakable text.
pub fn normalize_chapter(
    html: &[u8],
    config: &NormalizationConfig,
    rules: &CompiledRules,
) -> Result<String> {
    let stripped = strip_html(html)?;
    Ok(normalize_text(&stripped, config, rules))
}

/// Pipeline stages after tag stripping, exposed for direct text input.
pub fn normalize_text(text: &str, config: &NormalizationConfig, rules: &CompiledRules) -> String {
    let mut current = text.to_string();
    if config.apply_footnote_cleanup {
        current = clean_footnotes(&current);
    }
    if !rules.is_empty() {
        current = rules.apply(&current);
    }
    apply_newline_mode(&current, config.newline_mode, &config.break_string)
}

/// Strip markup from chapter HTML. `<script>` and `<style>` subtrees are
/// dropped entirely; block-level elements insert newline boundaries, inline
/// elements do not.
pub fn strip_html(html: &[u8]) -> Result<String> {
    let dom = parse_dom(html)?;
    let mut out = String::new();
    collect_text(&dom.document, &mut out);
    Ok(out)
}

fn parse_dom(html: &[u8]) -> Result<RcDom> {
    parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut &html[..])
        .map_err(|e| ConversionError::NormalizationFailed(format!("unreadable chapter HTML: {e}")))
}

fn collect_text(handle: &Handle, out: &mut String) {
    match &handle.data {
        NodeData::Text { contents } => {
            for c in contents.borrow().chars() {
                // Source newlines and tabs are insignificant whitespace;
                // only block boundaries produce real newlines.
                match c {
                    '\n' | '\r' | '\t' => out.push(' '),
                    _ => out.push(c),
                }
            }
        }
        NodeData::Element { name, .. } => match &*name.local {
            "script" | "style" | "head" => {}
            "br" => out.push('\n'),
            "p" | "div" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" => {
                if !out.is_empty() {
                    out.push('\n');
                }
                for child in handle.children.borrow().iter() {
                    collect_text(child, out);
                }
                if !out.is_empty() {
                    out.push('\n');
                }
            }
            _ => {
                for child in handle.children.borrow().iter() {
                    collect_text(child, out);
                }
            }
        },
        NodeData::Document => {
            for child in handle.children.borrow().iter() {
                collect_text(child, out);
            }
        }
        _ => {}
    }
}

/// Remove superscript-style and bracketed numeric references.
pub fn clean_footnotes(text: &str) -> String {
    let text = BRACKET_REF.replace_all(text, "");
    SUPERSCRIPT_REF.replace_all(&text, "$1").into_owned()
}

/// Rewrite newlines per the configured mode, then collapse whitespace runs
/// and trim. Inserted break strings survive the collapse untouched.
pub fn apply_newline_mode(text: &str, mode: NewlineMode, break_string: &str) -> String {
    let mark = BREAK_MARK.to_string();
    let marked = match mode {
        NewlineMode::Single => NEWLINE_RUN.replace_all(text, mark.as_str()).into_owned(),
        NewlineMode::Double => {
            let collapsed = DOUBLE_NEWLINE_RUN.replace_all(text, mark.as_str());
            collapsed.replace('\n', " ")
        }
        NewlineMode::None => text.replace('\n', " "),
    };

    let mut segments: Vec<String> = marked
        .split(BREAK_MARK)
        .map(|s| WHITESPACE_RUN.replace_all(s, " ").trim().to_string())
        .collect();
    while segments.first().map_or(false, |s| s.is_empty()) {
        segments.remove(0);
    }
    while segments.last().map_or(false, |s| s.is_empty()) {
        segments.pop();
    }
    segments.join(break_string)
}

/// Resolve the narration title for a chapter.
///
/// `auto` keeps nav/NCX titles when the reader found one and otherwise runs
/// the tag heuristic with a leading-text fallback; the explicit modes always
/// run their heuristic.
pub fn chapter_title(chapter: &Chapter, normalized: &str, mode: TitleMode) -> String {
    match mode {
        TitleMode::Auto => {
            if chapter.title_from_toc {
                return nonempty_or_placeholder(sanitize_component(&chapter.title));
            }
            let extracted = extract_title(&chapter.html, normalized, TitleMode::Auto);
            if extracted == TITLE_PLACEHOLDER && !chapter.title.is_empty() {
                nonempty_or_placeholder(sanitize_component(&chapter.title))
            } else {
                extracted
            }
        }
        other => extract_title(&chapter.html, normalized, other),
    }
}

/// Title heuristic over raw chapter HTML plus its normalized text.
pub fn extract_title(html: &[u8], normalized: &str, mode: TitleMode) -> String {
    match mode {
        TitleMode::FirstFew => first_few(normalized),
        TitleMode::TagText => match heading_text(html) {
            Some(text) => nonempty_or_placeholder(sanitize_component(&text)),
            None => TITLE_PLACEHOLDER.to_string(),
        },
        TitleMode::Auto => {
            let chosen = heading_text(html)
                .map(|t| sanitize_component(&t))
                .unwrap_or_default();
            if chosen.is_empty() || digits_and_spaces_only(&chosen) {
                first_few(normalized)
            } else {
                chosen
            }
        }
    }
}

fn first_few(normalized: &str) -> String {
    let head: String = normalized.chars().take(60).collect();
    nonempty_or_placeholder(sanitize_component(&head))
}

fn nonempty_or_placeholder(title: String) -> String {
    if title.is_empty() {
        TITLE_PLACEHOLDER.to_string()
    } else {
        title
    }
}

fn digits_and_spaces_only(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit() || c == ' ')
}

/// Text of the first of `<title>`, `<h1>`, `<h2>`, `<h3>` with non-blank
/// content, in that priority order.
fn heading_text(html: &[u8]) -> Option<String> {
    let dom = parse_dom(html).ok()?;
    for tag in ["title", "h1", "h2", "h3"] {
        if let Some(text) = find_tag_text(&dom.document, tag) {
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn find_tag_text(handle: &Handle, tag: &str) -> Option<String> {
    if let NodeData::Element { name, .. } = &handle.data {
        if &*name.local == tag {
            let mut text = String::new();
            collect_text(handle, &mut text);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    for child in handle.children.borrow().iter() {
        if let Some(text) = find_tag_text(child, tag) {
            return Some(text);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_rules() -> CompiledRules {
        CompiledRules::compile(&[]).unwrap()
    }

    fn config(mode: NewlineMode, break_string: &str, footnotes: bool) -> NormalizationConfig {
        NormalizationConfig {
            newline_mode: mode,
            break_string: break_string.to_string(),
            apply_footnote_cleanup: footnotes,
            ..NormalizationConfig::default()
        }
    }

    #[test]
    fn test_strip_paragraphs() {
        let text = strip_html(b"<html><body><p>Hello.</p><p>World.</p></body></html>").unwrap();
        let cfg = config(NewlineMode::None, "\n\n", false);
        assert_eq!(normalize_text(&text, &cfg, &no_rules()), "Hello. World.");
    }

    #[test]
    fn test_strip_drops_script_and_style() {
        let html = br#"<html><head><style>p { color: red }</style></head>
<body><script>var x = 1;</script><p>Kept text.</p></body></html>"#;
        let text = strip_html(html).unwrap();
        assert!(!text.contains("color"));
        assert!(!text.contains("var x"));
        assert!(text.contains("Kept text."));
    }

    #[test]
    fn test_no_tags_survive() {
        let html = b"<p>a <em>emph</em> <span class=\"x\">span</span> &amp; done</p>";
        let cfg = config(NewlineMode::None, " ", false);
        let out = normalize_text(&strip_html(html).unwrap(), &cfg, &no_rules());
        // No raw tag-open followed by a letter may remain.
        let mut chars = out.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '<' {
                assert!(!chars.peek().map_or(false, |n| n.is_alphabetic()), "tag in {out:?}");
            }
        }
        assert!(out.contains("emph"));
        assert!(out.contains("& done"));
    }

    #[test]
    fn test_footnote_cleanup() {
        let cfg = config(NewlineMode::None, "\n\n", true);
        let out = normalize_text("See this. 12 And also [3.1] end.", &cfg, &no_rules());
        assert_eq!(out, "See this. And also end.");
    }

    #[test]
    fn test_footnote_cleanup_keeps_years() {
        let cfg = config(NewlineMode::None, "\n\n", true);
        let out = normalize_text("It happened in 1984, honestly.", &cfg, &no_rules());
        assert_eq!(out, "It happened in 1984, honestly.");
    }

    #[test]
    fn test_newline_modes() {
        let input = "a\n\nb\nc";
        assert_eq!(
            apply_newline_mode(input, NewlineMode::Single, "|"),
            "a|b|c"
        );
        assert_eq!(
            apply_newline_mode(input, NewlineMode::Double, "|"),
            "a|b c"
        );
        assert_eq!(apply_newline_mode(input, NewlineMode::None, "|"), "a b c");
    }

    #[test]
    fn test_none_mode_leaves_no_newlines() {
        let cfg = config(NewlineMode::None, "\n\n", false);
        let out = normalize_text("x\n\n\ny\nz\n", &cfg, &no_rules());
        assert!(!out.contains('\n'));
        assert_eq!(out, "x y z");
    }

    #[test]
    fn test_break_string_survives_collapse() {
        let out = apply_newline_mode("a\n\nb", NewlineMode::Double, "\n\n");
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn test_leading_and_trailing_breaks_dropped() {
        let out = apply_newline_mode("\n\na\n\n", NewlineMode::Single, "|");
        assert_eq!(out, "a");
    }

    #[test]
    fn test_rules_applied_in_order() {
        let rules = CompiledRules::compile(&[
            SearchReplaceRule {
                pattern: "cat".to_string(),
                replacement: "dog".to_string(),
                case_insensitive: false,
            },
            SearchReplaceRule {
                pattern: "DOG".to_string(),
                replacement: "wolf".to_string(),
                case_insensitive: true,
            },
        ])
        .unwrap();
        let cfg = config(NewlineMode::None, "\n\n", false);
        assert_eq!(normalize_text("a cat here", &cfg, &rules), "a wolf here");
    }

    #[test]
    fn test_invalid_rule_fails() {
        let err = CompiledRules::compile(&[SearchReplaceRule {
            pattern: "(unclosed".to_string(),
            replacement: String::new(),
            case_insensitive: false,
        }])
        .unwrap_err();
        assert!(matches!(err, ConversionError::NormalizationFailed(_)));
    }

    #[test]
    fn test_list_items_become_boundaries() {
        let html = b"<ul><li>alpha</li><li>beta</li></ul>";
        let stripped = strip_html(html).unwrap();
        let cfg = config(NewlineMode::Single, " | ", false);
        assert_eq!(normalize_text(&stripped, &cfg, &no_rules()), "alpha | beta");
    }

    #[test]
    fn test_nbsp_collapses_like_whitespace() {
        let html = "<p>wide\u{a0}\u{a0}gap</p>".as_bytes().to_vec();
        let cfg = config(NewlineMode::None, " ", false);
        let out = normalize_text(&strip_html(&html).unwrap(), &cfg, &no_rules());
        assert_eq!(out, "wide gap");
    }

    #[test]
    fn test_soft_break_becomes_space_in_double_mode() {
        let html = b"<p>line one<br/>line two</p><p>next paragraph</p>";
        let stripped = strip_html(html).unwrap();
        let cfg = config(NewlineMode::Double, "\n\n", false);
        let out = normalize_text(&stripped, &cfg, &no_rules());
        assert_eq!(out, "line one line two\n\nnext paragraph");
    }

    #[test]
    fn test_rule_capture_groups() {
        let rules = CompiledRules::compile(&[SearchReplaceRule {
            pattern: r"Mr\. (\w+)".to_string(),
            replacement: "Mister $1".to_string(),
            case_insensitive: false,
        }])
        .unwrap();
        let cfg = config(NewlineMode::None, " ", false);
        assert_eq!(
            normalize_text("Mr. Smith waved.", &cfg, &rules),
            "Mister Smith waved."
        );
    }

    #[test]
    fn test_title_tag_text() {
        let html = b"<html><head><title>  The  Title </title></head><body><p>body</p></body></html>";
        assert_eq!(extract_title(html, "body", TitleMode::TagText), "The Title");
    }

    #[test]
    fn test_title_heading_priority() {
        let html = b"<html><body><h2>Second</h2><h1>First</h1></body></html>";
        // <h1> outranks <h2> regardless of document position.
        assert_eq!(extract_title(html, "x", TitleMode::TagText), "First");
    }

    #[test]
    fn test_title_auto_rejects_bare_numbers() {
        let html = b"<html><body><h1>12</h1><p>Actual opening words here.</p></body></html>";
        let title = extract_title(html, "Actual opening words here.", TitleMode::Auto);
        assert_eq!(title, "Actual opening words here.");
    }

    #[test]
    fn test_title_first_few_truncates() {
        let text = "x".repeat(100);
        let title = extract_title(b"<p></p>", &text, TitleMode::FirstFew);
        assert_eq!(title.chars().count(), 60);
    }

    #[test]
    fn test_title_placeholder_when_empty() {
        assert_eq!(extract_title(b"<p></p>", "", TitleMode::TagText), "<blank>");
        assert_eq!(extract_title(b"<p></p>", "", TitleMode::FirstFew), "<blank>");
    }

    #[test]
    fn test_title_sanitizes_hostile_characters() {
        let html = b"<html><body><h1>Part 1: Into/Out?</h1></body></html>";
        let title = extract_title(html, "x", TitleMode::TagText);
        assert!(!title.contains(':') && !title.contains('/') && !title.contains('?'));
    }

    #[test]
    fn test_chapter_title_prefers_toc_in_auto() {
        let chapter = Chapter {
            index: 0,
            title: "From The Nav".to_string(),
            title_from_toc: true,
            href: "c1.xhtml".to_string(),
            html: b"<h1>From The Heading</h1>".to_vec(),
        };
        assert_eq!(
            chapter_title(&chapter, "text", TitleMode::Auto),
            "From The Nav"
        );
        assert_eq!(
            chapter_title(&chapter, "text", TitleMode::TagText),
            "From The Heading"
        );
    }

    #[test]
    fn test_chapter_title_href_fallback_in_auto() {
        let chapter = Chapter {
            index: 3,
            title: "chap four".to_string(),
            title_from_toc: false,
            href: "chap-four.xhtml".to_string(),
            html: b"<p></p>".to_vec(),
        };
        // Nothing to extract from markup or text: the reader's href-derived
        // title stands.
        assert_eq!(chapter_title(&chapter, "", TitleMode::Auto), "chap four");
    }
}
