// Built-in ad lexicon and pattern compilation.
//
// Every configurable pattern goes through `compile`, which logs and skips a
// malformed regex instead of failing the whole detector.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::config::DetectorConfig;

// Sponsor-read trigger phrases.
const KEYWORDS: &[&str] = &[
    r"brought to you by",
    r"sponsored by",
    r"today'?s sponsor",
    r"this (?:episode|video|show|podcast|newsletter|issue|week'?s issue) is (?:sponsored|brought to you|supported|made possible)",
    r"thanks? to (?:our sponsor|our friends at|\w+ for sponsoring)",
    r"support for (?:this|the) (?:show|podcast|program|episode) comes from",
    r"a word from (?:our|today'?s) sponsors?",
    r"promo code",
    r"discount code",
    r"coupon code",
    r"use (?:the )?code",
    r"sign up at",
    r"(?:go|head|visit) (?:to|over to) [\w.-]+\.(?:com|net|org|io|co|fm)/\w+",
    r"free trial",
    r"\d{1,3}% off",
    r"(?:first|1st) (?:month|box|order) (?:is )?free",
    r"affiliate link",
];

// Brands with a history of sponsoring podcasts, videos and newsletters.
const ADVERTISERS: &[&str] = &[
    "squarespace",
    "nordvpn",
    "expressvpn",
    "surfshark",
    "betterhelp",
    "athletic greens",
    "ag1",
    "hellofresh",
    "factor",
    "audible",
    "skillshare",
    "brilliant",
    "masterclass",
    "manscaped",
    "casper",
    "helix sleep",
    "blue apron",
    "ziprecruiter",
    "indeed",
    "linkedin jobs",
    "stamps.com",
    "simplisafe",
    "honey",
    "grammarly",
    "dollar shave club",
    "harry's",
    "mack weldon",
    "quip",
    "shopify",
    "wix",
    "hover",
    "linode",
    "notion",
    "slack",
    "calm",
    "headspace",
    "magic spoon",
    "rocket money",
    "policygenius",
    "babbel",
    "curiositystream",
    "nebula",
    "displate",
    "incogni",
    "aura",
    "raid shadow legends",
    "liquid i.v.",
    "rxbar",
    "native deodorant",
    "mint mobile",
];

// Brand-as-common-word and other look-alikes. A hit multiplies confidence
// by the configured penalty.
const NEGATIVES: &[(&str, &str)] = &[
    ("notion_common_noun", r"\bnotions? (?:of|that)\b"),
    (
        "slack_community",
        r"\bslack (?:community|channel|group|workspace|server|thread|message)s?\b",
    ),
    (
        "slack_verb",
        r"\b(?:cut|pick(?:ing)? up|pull(?:ing)? up|take up|picked up) (?:the |some |a little )?slack\b",
    ),
    (
        "indeed_adverb",
        r"(?:^|[.!?]\s+)indeed,|\b(?:has|have|had|is|was|are|were|do|does|did|am) indeed\b|\bindeed[.!?]",
    ),
    (
        "calm_adjective",
        r"\b(?:stay|stayed|keep|kept|remain|remained|be|feel|felt|was|is|very|so) calm\b",
    ),
    (
        "honey_food",
        r"\bhoney ?(?:bees?|comb|badgers?|mustard|glaze)\b|\b(?:of|with|and) honey\b",
    ),
    (
        "audible_adjective",
        r"\b(?:barely|clearly|hardly|was|is|an|faintly) audible\b",
    ),
    (
        "brilliant_adjective",
        r"\b(?:a|is|was|so|truly|absolutely|really|just) brilliant\b",
    ),
    (
        "advertising_reference",
        r"\b(?:history|regulation|regulations|era|golden age|ban|standards|ethics) of advertising\b|\badvertising (?:standards|regulations?|industry|history|executives?|agency|agencies|law)\b|\bfederal trade commission\b",
    ),
    (
        "self_promotion",
        r"\b(?:our|my) (?:own )?(?:newsletter|patreon|substack|website|book|merch|store)\b|\bsubscribe to (?:our|my|this) (?:newsletter|podcast|channel|show)\b|\bsupport (?:us|the show|this show) on patreon\b",
    ),
];

const URL_PATTERNS: &[&str] = &[
    r"\b(?:bit\.ly|geni\.us|amzn\.to|tinyurl\.com|ow\.ly|buff\.ly|lnk\.to|podtrac\.com|chtbl\.com|pdst\.fm)/\S+",
    r"(?:https?://)?[\w.-]+\.[a-z]{2,}\S*[?&]utm_[a-z]+=\S*",
    r"\b[\w.-]+\.[a-z]{2,}/(?:aff|affiliate|promo|ref|partner|go|deal|offer)s?\b\S*",
    r"[?&](?:ref|aff|affiliate|via|coupon)=[\w-]+",
];

// Words that make an advertiser mention look like an ad read.
static AD_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(
        r"\b(?:sponsor(?:s|ed|ing|ship)?|promo(?:s|tion|tional)?|discounts?|free trial|coupons?|codes?|offers?|deals?|\d{1,3}% off|sign ?up|brought to you|check ?out|affiliate|partner(?:ed|ship)?|special link|exclusive)\b",
    )
    .case_insensitive(true)
    .build()
    .expect("Invalid ad-context regex")
});

// "## Sponsor", "### A word from our sponsors", "**Together with Acme**".
static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(
        r"^(?:#{1,6}[ \t]*|\*\*[ \t]*)(?:sponsor(?:ed|s|ship)?(?: (?:message|content|section|spotlight))?|advertisement|a word from (?:our|today'?s) sponsors?|from our sponsors?|partner(?:ed)? (?:content|message)|together with\b[^\n]*|presented by\b[^\n]*|today'?s sponsor)\b[^\n]*$",
    )
    .case_insensitive(true)
    .multi_line(true)
    .build()
    .expect("Invalid section header regex")
});

// Next header or horizontal rule ends a sponsor section.
static SECTION_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:#{1,6}[ \t]|(?:-{3,}|\*{3,}|_{3,})[ \t]*\r?$)")
        .expect("Invalid section end regex")
});

/// A compiled pattern plus the name reported in detections.
#[derive(Debug, Clone)]
pub struct NamedPattern {
    pub name: String,
    pub regex: Regex,
}

/// Everything the detector matches against, compiled once.
#[derive(Debug, Clone)]
pub struct PatternSet {
    pub keywords: Vec<NamedPattern>,
    pub advertisers: Vec<NamedPattern>,
    pub urls: Vec<NamedPattern>,
    pub negatives: Vec<NamedPattern>,
}

impl PatternSet {
    /// Built-in lexicon extended with the configured extras.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let keywords = KEYWORDS
            .iter()
            .map(|s| s.to_string())
            .chain(config.extra_keywords.iter().cloned())
            .filter_map(|src| compile("keyword", &src, &src))
            .collect();

        let advertisers = ADVERTISERS
            .iter()
            .map(|s| s.to_string())
            .chain(config.extra_advertisers.iter().map(|s| s.to_lowercase()))
            .filter_map(|name| compile("advertiser", &name, &brand_pattern(&name)))
            .collect();

        let urls = URL_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .chain(config.extra_url_patterns.iter().cloned())
            .filter_map(|src| compile("url_pattern", &src, &src))
            .collect();

        let negatives = NEGATIVES
            .iter()
            .map(|(name, src)| (name.to_string(), src.to_string()))
            .chain(
                config
                    .extra_negative_patterns
                    .iter()
                    .map(|src| (src.clone(), src.clone())),
            )
            .filter_map(|(name, src)| compile("negative", &name, &src))
            .collect();

        Self {
            keywords,
            advertisers,
            urls,
            negatives,
        }
    }

    pub fn has_keyword(&self, text: &str) -> bool {
        self.keywords.iter().any(|p| p.regex.is_match(text))
    }

    pub fn has_advertiser(&self, text: &str) -> bool {
        self.advertisers.iter().any(|p| p.regex.is_match(text))
    }

    pub fn has_tracking_url(&self, text: &str) -> bool {
        self.urls.iter().any(|p| p.regex.is_match(text))
    }

    /// Names of every negative pattern matching `text`.
    pub fn negative_hits(&self, text: &str) -> Vec<String> {
        self.negatives
            .iter()
            .filter(|p| p.regex.is_match(text))
            .map(|p| p.name.clone())
            .collect()
    }
}

pub fn ad_context() -> &'static Regex {
    &AD_CONTEXT
}

pub fn section_header() -> &'static Regex {
    &SECTION_HEADER
}

pub fn section_end() -> &'static Regex {
    &SECTION_END
}

/// Case-insensitive whole-word pattern for a brand name. Word boundaries are
/// only asserted next to word characters, so names like "liquid i.v." work.
pub fn brand_pattern(name: &str) -> String {
    let escaped = regex::escape(name);
    let starts_word = name.chars().next().is_some_and(|c| c.is_alphanumeric());
    let ends_word = name.chars().last().is_some_and(|c| c.is_alphanumeric());
    format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        escaped,
        if ends_word { r"\b" } else { "" }
    )
}

fn compile(kind: &str, name: &str, source: &str) -> Option<NamedPattern> {
    match RegexBuilder::new(source).case_insensitive(true).build() {
        Ok(regex) => Some(NamedPattern {
            name: name.to_string(),
            regex,
        }),
        Err(e) => {
            warn!(kind, pattern = source, error = %e, "skipping malformed pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> PatternSet {
        PatternSet::from_config(&DetectorConfig::default())
    }

    #[test]
    fn builtin_lexicon_compiles_completely() {
        let p = defaults();
        assert_eq!(p.keywords.len(), KEYWORDS.len());
        assert_eq!(p.advertisers.len(), ADVERTISERS.len());
        assert_eq!(p.urls.len(), URL_PATTERNS.len());
        assert_eq!(p.negatives.len(), NEGATIVES.len());
    }

    #[test]
    fn malformed_extra_patterns_are_skipped() {
        let cfg = DetectorConfig {
            extra_keywords: vec!["(unclosed".to_string(), "exclusive offer".to_string()],
            extra_negative_patterns: vec!["[bad".to_string()],
            ..DetectorConfig::default()
        };
        let p = PatternSet::from_config(&cfg);
        assert_eq!(p.keywords.len(), KEYWORDS.len() + 1);
        assert_eq!(p.negatives.len(), NEGATIVES.len());
        assert!(p.has_keyword("An EXCLUSIVE OFFER for listeners"));
    }

    #[test]
    fn brand_matches_whole_words_only() {
        let p = defaults();
        assert!(p.has_advertiser("Thanks to Slack for this"));
        assert!(!p.has_advertiser("the slacker stayed home"));
        assert!(p.has_advertiser("try Liquid I.V. today"));
        assert!(p.has_advertiser("order at stamps.com now"));
    }

    #[test]
    fn tracking_urls() {
        let p = defaults();
        assert!(p.has_tracking_url("go to nordvpn.com/promo now"));
        assert!(p.has_tracking_url("https://example.com/page?utm_source=pod"));
        assert!(p.has_tracking_url("bit.ly/3abcXYZ"));
        assert!(p.has_tracking_url("shop.example.com/aff/12"));
        assert!(!p.has_tracking_url("see example.com/about for details"));
    }

    #[test]
    fn negative_patterns_name_what_fired() {
        let p = defaults();
        assert_eq!(
            p.negative_hits("the notion of remote work"),
            vec!["notion_common_noun".to_string()]
        );
        assert!(p
            .negative_hits("Indeed, the results were clear.")
            .contains(&"indeed_adverb".to_string()));
        assert!(p
            .negative_hits("join our Slack community")
            .contains(&"slack_community".to_string()));
        assert!(p.negative_hits("Use code SAVE20 at checkout").is_empty());
    }

    #[test]
    fn section_headers_match_line_starts() {
        let text = "Intro\n\n## Sponsor\n\nBody\n\n## Next\n";
        let m = section_header().find(text).unwrap();
        assert_eq!(&text[m.start()..m.end()], "## Sponsor");
        assert!(section_header().find("We discuss the sponsor model.").is_none());
        assert!(section_end().is_match("---\n"));
    }
}
