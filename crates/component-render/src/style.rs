//! Stylesheet detection, validation and compilation
//!
//! Component styles arrive as CSS, SCSS or LESS. The renderer only ever writes
//! plain CSS into the template, so SCSS goes through `grass` and LESS through
//! the `lessc` compiler when it is installed.

use std::process::Stdio;

use cssparser::{ParseError, Parser, ParserInput, Token};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

static SCSS_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$[a-zA-Z0-9\-_]+:|@mixin|@include|&:").expect("valid SCSS pattern")
});

static LESS_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@[a-zA-Z0-9\-_]+:|\.([a-zA-Z0-9\-_]+\s*\()|& when").expect("valid LESS pattern")
});

/// Stylesheet language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleLanguage {
    Css,
    Scss,
    Less,
}

impl StyleLanguage {
    /// Classify a stylesheet by its syntax; SCSS markers win over LESS markers
    pub fn detect(text: &str) -> Self {
        if SCSS_SYNTAX.is_match(text) {
            StyleLanguage::Scss
        } else if LESS_SYNTAX.is_match(text) {
            StyleLanguage::Less
        } else {
            StyleLanguage::Css
        }
    }

    /// Whether `text` parses in this language
    pub async fn is_valid(&self, text: &str) -> bool {
        match self {
            StyleLanguage::Css => is_valid_css(text),
            StyleLanguage::Scss => is_valid_scss(text),
            StyleLanguage::Less => is_valid_less(text).await,
        }
    }

    /// Compile `text` to CSS, returning it unchanged when compilation fails
    pub async fn compile_to_css(&self, text: &str) -> String {
        match self {
            StyleLanguage::Css => text.to_string(),
            StyleLanguage::Scss => scss_to_css(text),
            StyleLanguage::Less => less_to_css(text).await,
        }
    }
}

/// Turn a job's style text into the CSS written next to the component
///
/// Returns `None` when there is nothing usable: empty input, input that does
/// not parse in its detected language, or an empty compilation result.
pub async fn normalize(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    let language = StyleLanguage::detect(text);
    if !language.is_valid(text).await {
        log::warn!("Style is not valid {:?}, rendering without it", language);
        return None;
    }

    let css = language.compile_to_css(text).await;
    log::debug!("Style is valid {:?}", language);
    if css.trim().is_empty() {
        None
    } else {
        Some(css)
    }
}

/// Check CSS syntax
pub fn is_valid_css(text: &str) -> bool {
    if !braces_balanced(text) {
        return false;
    }
    let mut input = ParserInput::new(text);
    let mut parser = Parser::new(&mut input);
    scan_stylesheet(&mut parser).is_ok()
}

/// Top level: rules and at-rules; a bare `;` is only allowed after an at-rule
fn scan_stylesheet<'i, 't>(parser: &mut Parser<'i, 't>) -> Result<(), ParseError<'i, ()>> {
    let mut in_at_rule = false;
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => return Ok(()),
        };
        match token {
            Token::AtKeyword(_) => in_at_rule = true,
            Token::Semicolon if !in_at_rule => return Err(parser.new_custom_error(())),
            Token::Semicolon => in_at_rule = false,
            Token::CurlyBracketBlock => {
                parser.parse_nested_block(|nested| scan_block(nested))?;
                in_at_rule = false;
            }
            other => reject_bad_token(parser, &other)?,
        }
    }
}

fn scan_block<'i, 't>(parser: &mut Parser<'i, 't>) -> Result<(), ParseError<'i, ()>> {
    loop {
        let token = match parser.next() {
            Ok(token) => token.clone(),
            Err(_) => return Ok(()),
        };
        reject_bad_token(parser, &token)?;
    }
}

fn reject_bad_token<'i, 't>(
    parser: &mut Parser<'i, 't>,
    token: &Token<'i>,
) -> Result<(), ParseError<'i, ()>> {
    match token {
        Token::BadUrl(_)
        | Token::BadString(_)
        | Token::CloseParenthesis
        | Token::CloseSquareBracket
        | Token::CloseCurlyBracket => Err(parser.new_custom_error(())),
        Token::CurlyBracketBlock
        | Token::ParenthesisBlock
        | Token::SquareBracketBlock
        | Token::Function(_) => parser.parse_nested_block(|nested| scan_block(nested)),
        _ => Ok(()),
    }
}

/// `cssparser` closes unterminated blocks at end of input, so count them here
fn braces_balanced(text: &str) -> bool {
    let mut depth: i64 = 0;
    let mut chars = text.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => {
                    chars.next();
                }
                c if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }

    depth == 0 && quote.is_none()
}

fn scss_options() -> grass::Options<'static> {
    grass::Options::default().style(grass::OutputStyle::Compressed)
}

/// Check SCSS syntax by compiling it
pub fn is_valid_scss(text: &str) -> bool {
    grass::from_string(text.to_string(), &scss_options()).is_ok()
}

/// Compile SCSS to compressed CSS
pub fn scss_to_css(text: &str) -> String {
    match grass::from_string(text.to_string(), &scss_options()) {
        Ok(css) => css,
        Err(e) => {
            log::debug!("SCSS compilation failed: {}", e);
            text.to_string()
        }
    }
}

/// Check LESS syntax with `lessc --lint`; without `lessc` the style is rejected
pub async fn is_valid_less(text: &str) -> bool {
    run_lessc(&["--lint", "-"], text).await.is_some()
}

/// Compile LESS to compressed CSS with `lessc`
pub async fn less_to_css(text: &str) -> String {
    match run_lessc(&["--compress", "-"], text).await {
        Some(css) => css,
        None => text.to_string(),
    }
}

/// Pipe `input` through `lessc`, returning stdout on success
async fn run_lessc(args: &[&str], input: &str) -> Option<String> {
    let lessc = match which::which("lessc") {
        Ok(path) => path,
        Err(_) => {
            log::warn!("lessc not found on PATH, LESS styles are skipped");
            return None;
        }
    };

    let mut child = Command::new(lessc)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| log::warn!("Failed to run lessc: {}", e))
        .ok()?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            log::debug!("Failed to write to lessc: {}", e);
            return None;
        }
    }

    let output = child.wait_with_output().await.ok()?;
    if !output.status.success() {
        log::debug!(
            "lessc rejected the style: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_plain_css() {
        assert_eq!(
            StyleLanguage::detect(".card { color: red; }"),
            StyleLanguage::Css
        );
    }

    #[test]
    fn test_detect_scss() {
        assert_eq!(
            StyleLanguage::detect("$primary: #333;\n.a { color: $primary; }"),
            StyleLanguage::Scss
        );
        assert_eq!(
            StyleLanguage::detect(".a { &:hover { color: red; } }"),
            StyleLanguage::Scss
        );
    }

    #[test]
    fn test_detect_less() {
        assert_eq!(
            StyleLanguage::detect("@primary: #333;\n.a { color: @primary; }"),
            StyleLanguage::Less
        );
        assert_eq!(
            StyleLanguage::detect(".a { .rounded(4px); }"),
            StyleLanguage::Less
        );
    }

    #[test]
    fn test_scss_takes_priority_over_less() {
        let both = "@base: 1px;\n$gap: 2px;\n.a { margin: $gap; }";
        assert_eq!(StyleLanguage::detect(both), StyleLanguage::Scss);
    }

    #[test]
    fn test_css_validity() {
        assert!(is_valid_css(".a { color: red; }\n@media (max-width: 10px) { .b { margin: 0; } }"));
        assert!(is_valid_css("@import url('x.css');\n.a { color: red; }"));
        assert!(!is_valid_css(".a { color: red; "));
        assert!(!is_valid_css(".a { color: red; } }"));
        assert!(!is_valid_css("color: red;"));
    }

    #[test]
    fn test_braces_in_strings_and_comments_are_ignored() {
        assert!(braces_balanced(".a::after { content: '{'; } /* } */"));
        assert!(!braces_balanced(".a { content: \"x\" "));
    }

    #[test]
    fn test_scss_compiles_to_css() {
        let css = scss_to_css("$c: red;\n.a { .b { color: $c; } }");
        assert!(css.contains(".a .b"));
        assert!(css.contains("red"));
        assert!(is_valid_scss("$c: red;\n.a { color: $c; }"));
        assert!(!is_valid_scss(".a { color: $undefined; }"));
    }

    #[test]
    fn test_scss_failure_returns_original() {
        let broken = ".a { color: $missing; }";
        assert_eq!(scss_to_css(broken), broken);
    }

    #[tokio::test]
    async fn test_normalize_empty_and_invalid() {
        assert_eq!(normalize("").await, None);
        assert_eq!(normalize("   \n").await, None);
        assert_eq!(normalize(".a { color: red;").await, None);
    }

    #[tokio::test]
    async fn test_normalize_css_is_unchanged() {
        let css = ".a { color: red; }";
        assert_eq!(normalize(css).await.as_deref(), Some(css));
    }
}
