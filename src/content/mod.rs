//! Mixed-content classification
//!
//! The upstream model interleaves deliberation, the actual answer, and a
//! trailing follow-up-question block in one cumulative text stream, and may
//! rewrite earlier deliberation into answer form as the stream grows. The
//! splitter therefore always re-classifies the *whole* cumulative text:
//! collapsed `<details>` blocks and `[THINK]` markers first, then leading
//! meta-reasoning paragraphs, then the 【推荐问题】 suggestions block, and
//! finally a cosmetic redaction pass over everything destined for display.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker introducing the follow-up-question block the backend is prompted
/// to emit after each answer.
pub const SUGGESTION_MARKER: &str = "【推荐问题】";

static DETAILS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<details.*?<summary>.*?</summary>(.*?)</details>")
        .expect("details pattern compiles")
});

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[THINK\](.*?)\[/THINK\]").expect("think pattern compiles"));

static HTML_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").expect("html tag pattern compiles"));

static BLANK_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{2,}").expect("blank line pattern compiles"));

static ORDINAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\s*").expect("ordinal pattern compiles"));

static THINKING_FILLER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:Thinking|思考中)\s*\.{0,3}").expect("filler pattern compiles")
});

/// Lead-in phrasing the upstream model uses when it narrates its own
/// process. Anchored to the start of the remaining text.
const DEFAULT_LEAD_IN: &str = r"(?i)^\s*(?:思考步骤|分析流程|推理过程|思考过程|分析步骤|推理步骤|分析思路|推理思路|分析|推理|思考|流程|步骤|首先|需要先|请先|优先|需先|失败则|如需|如果.*?，|务必|Thought:|Thinking:)";

/// Tool and method identifiers that must never leak into displayed text.
const DEFAULT_REDACTION_PATTERN: &str = r"(?i)(?:kline_get|get_kline|option_chain_get|get_option_chain|yahoo_finance_news|get_news_sentiment|quote_get|get_quote|financial_summary_get|get_financial_summary|news_sentiment|symbol='[A-Z]+'|interval='[a-z0-9]+'|参数：.*?')";

const DEFAULT_REDACTION_LITERAL: &str = "贾维斯工具箱🧰";

const DEFAULT_PLACEHOLDER: &str = "QuantChat 工具箱";

/// Classified view of one cumulative answer text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitOutput {
    /// Plain-text deliberation feed (HTML stripped, redacted).
    pub reasoning: String,
    /// The displayable answer (redacted, suggestion block removed).
    pub final_text: String,
    /// Parsed follow-up questions, in document order.
    pub suggestions: Vec<String>,
}

/// Decides whether a paragraph reads as meta-reasoning rather than answer.
///
/// The default token set is heuristic and phrasing-specific; swapping the
/// classifier tunes the splitting without touching the algorithm.
pub trait LeadInClassifier: Send + Sync {
    fn is_lead_in(&self, paragraph: &str) -> bool;
}

/// Regex classifier over a fixed set of lead-in tokens.
pub struct TokenLeadIn {
    pattern: Regex,
}

impl TokenLeadIn {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

impl Default for TokenLeadIn {
    fn default() -> Self {
        Self::new(Regex::new(DEFAULT_LEAD_IN).expect("lead-in pattern compiles"))
    }
}

impl LeadInClassifier for TokenLeadIn {
    fn is_lead_in(&self, paragraph: &str) -> bool {
        self.pattern.is_match(paragraph)
    }
}

/// Substitutions applied to display text. Cosmetic only: matched substrings
/// are replaced, structure is never changed.
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    /// Replacement token shown wherever an internal identifier matched.
    pub placeholder: String,
    /// Exact strings to replace.
    pub literals: Vec<String>,
    /// Regex patterns to replace.
    pub patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            literals: vec![DEFAULT_REDACTION_LITERAL.to_string()],
            patterns: vec![DEFAULT_REDACTION_PATTERN.to_string()],
        }
    }
}

struct Redactor {
    placeholder: String,
    literals: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    fn new(config: RedactionConfig) -> Self {
        let patterns = config
            .patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = %p, error = %err, "skipping invalid redaction pattern");
                    None
                }
            })
            .collect();
        Self {
            placeholder: config.placeholder,
            literals: config.literals,
            patterns,
        }
    }

    fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for literal in &self.literals {
            out = out.replace(literal, &self.placeholder);
        }
        for pattern in &self.patterns {
            out = pattern
                .replace_all(&out, self.placeholder.as_str())
                .into_owned();
        }
        out
    }
}

/// Pure classifier from cumulative answer text to reasoning / final /
/// suggestions. Never fails: absent markers yield an empty reasoning feed,
/// no suggestions, and a final equal to the (redacted) input.
pub struct ContentSplitter {
    redactor: Redactor,
    lead_in: Box<dyn LeadInClassifier>,
}

impl Default for ContentSplitter {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

impl ContentSplitter {
    pub fn new(redaction: RedactionConfig) -> Self {
        Self::with_classifier(redaction, Box::new(TokenLeadIn::default()))
    }

    pub fn with_classifier(
        redaction: RedactionConfig,
        lead_in: Box<dyn LeadInClassifier>,
    ) -> Self {
        Self {
            redactor: Redactor::new(redaction),
            lead_in,
        }
    }

    pub fn split(&self, text: &str) -> SplitOutput {
        let mut reasoning_parts: Vec<String> = Vec::new();

        // Collapsed-details blocks, then explicit [THINK] markers.
        for caps in DETAILS_RE.captures_iter(text) {
            reasoning_parts.push(caps[1].trim().to_string());
        }
        let mut working = DETAILS_RE.replace_all(text, "").trim().to_string();
        for caps in THINK_RE.captures_iter(&working) {
            reasoning_parts.push(caps[1].trim().to_string());
        }
        working = THINK_RE.replace_all(&working, "").trim().to_string();

        // Repeatedly peel leading meta-reasoning paragraphs. Matching is
        // anchored to the start of the remaining text only, so the loop
        // always consumes at least one paragraph and terminates.
        loop {
            let trimmed = working.trim_start();
            if trimmed.is_empty() {
                working = String::new();
                break;
            }
            let (paragraph, rest) = match BLANK_LINE_RE.find(trimmed) {
                Some(m) => (&trimmed[..m.start()], &trimmed[m.end()..]),
                None => (trimmed, ""),
            };
            if self.lead_in.is_lead_in(paragraph) {
                reasoning_parts.push(paragraph.trim().to_string());
                working = rest.to_string();
            } else {
                working = trimmed.to_string();
                break;
            }
        }

        let suggestions = Self::extract_suggestions(&mut working);

        let reasoning_raw = reasoning_parts.join("\n\n");
        let reasoning = self
            .redactor
            .apply(clean_thinking_filler(&strip_html(&reasoning_raw)));
        let final_text = self.redactor.apply(working.trim());

        SplitOutput {
            reasoning,
            final_text,
            suggestions,
        }
    }

    /// Remove the 【推荐问题】 block from the working text and parse its
    /// numbered lines. The block ends at a blank line, a following 【 or [,
    /// or end of text.
    fn extract_suggestions(working: &mut String) -> Vec<String> {
        let Some(start) = working.find(SUGGESTION_MARKER) else {
            return Vec::new();
        };
        let body_start = start + SUGGESTION_MARKER.len();
        let body = &working[body_start..];
        let mut end = body.len();
        if let Some(m) = BLANK_LINE_RE.find(body) {
            end = end.min(m.start());
        }
        if let Some(p) = body.find('【') {
            end = end.min(p);
        }
        if let Some(p) = body.find('[') {
            end = end.min(p);
        }

        let suggestions = body[..end]
            .lines()
            .map(|line| ORDINAL_RE.replace(line, "").trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with('【'))
            .collect();

        let mut remainder = working[..start].trim_end().to_string();
        let tail = working[body_start + end..].trim_start();
        if !tail.is_empty() {
            remainder.push_str("\n\n");
            remainder.push_str(tail);
        }
        *working = remainder;
        suggestions
    }
}

fn strip_html(text: &str) -> String {
    HTML_TAG_RE.replace_all(text, "").into_owned()
}

/// Trim the upstream's "Thinking ..." / "思考中..." filler off the front of
/// the deliberation feed.
fn clean_thinking_filler(text: &str) -> &str {
    match THINKING_FILLER_RE.find(text) {
        Some(m) if m.start() == 0 => text[m.end()..].trim(),
        _ => text.trim(),
    }
}
