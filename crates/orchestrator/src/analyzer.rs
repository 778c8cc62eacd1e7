//! Single-pass heuristic analysis of a user prompt.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Code,
    Creative,
    Analysis,
    Research,
    Translation,
    Summarization,
    Conversation,
    General,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Code => "CODE",
            ContentType::Creative => "CREATIVE",
            ContentType::Analysis => "ANALYSIS",
            ContentType::Research => "RESEARCH",
            ContentType::Translation => "TRANSLATION",
            ContentType::Summarization => "SUMMARIZATION",
            ContentType::Conversation => "CONVERSATION",
            ContentType::General => "GENERAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "SIMPLE",
            Complexity::Moderate => "MODERATE",
            Complexity::Complex => "COMPLEX",
            Complexity::Expert => "EXPERT",
        }
    }
}

/// Metadata of a file sent alongside a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub mime_type: Option<String>,
}

impl Attachment {
    fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|mime| mime.starts_with("image/"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptAnalysis {
    pub complexity: Complexity,
    pub content_type: ContentType,
    pub word_count: usize,
    pub has_code: bool,
    pub has_images: bool,
    pub has_files: bool,
    pub language: &'static str,
    pub domain: Option<&'static str>,
    pub tech_stack: Vec<&'static str>,
    pub required_features: Vec<&'static str>,
    pub min_context_window: u64,
    pub required_capabilities: Vec<&'static str>,
    pub estimated_tokens: u64,
    pub accuracy_needed: f64,
    pub creativity_needed: f64,
    pub speed_priority: f64,
    pub budget_sensitivity: f64,
    pub quality_threshold: f64,
}

static CODE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(const|let|var|function|=>|async|await|import|export|class)\b",
        r"\b(def|class|import|from|if __name__|lambda|async def|yield)\b",
        r"\b(public|private|class|interface|extends|implements|static void)\b",
        r"\b(#include|std::|template|namespace|virtual|nullptr)\b",
        r"(?i)\b(SELECT|FROM|WHERE|JOIN|INSERT|UPDATE|DELETE|CREATE TABLE)\b",
        r"(?i)<[a-z][\s\S]*>",
        r"\{[\s\S]*?[a-z-]+\s*:\s*[^}]+\}",
        r"^\s*\{[\s\S]*\}\s*$",
        r"(?m)^#{1,6}\s|^\*{1,2}[^*]+\*{1,2}|^\[.+\]\(.+\)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static ARITHMETIC: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\d+[+\-*/]\d+").ok());

static LANGUAGE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("es", r"(?i)\b(el|la|los|las|un|una|es|está|son|como|pero|para)\b"),
        ("fr", r"(?i)\b(le|la|les|un|une|est|sont|comme|mais|pour|avec)\b"),
        ("de", r"(?i)\b(der|die|das|ein|eine|ist|sind|wie|aber|für|mit)\b"),
        ("it", r"(?i)\b(il|la|le|un|una|è|sono|come|ma|per|con)\b"),
        ("pt", r"(?i)\b(o|a|os|as|um|uma|é|são|como|mas|para|com)\b"),
        ("zh", r"[\x{4e00}-\x{9fa5}]"),
        ("ja", r"[\x{3040}-\x{309f}\x{30a0}-\x{30ff}]"),
        ("ko", r"[\x{ac00}-\x{d7af}]"),
        ("ar", r"[\x{0600}-\x{06ff}]"),
        ("ru", r"[\x{0400}-\x{04ff}]"),
    ]
    .into_iter()
    .filter_map(|(lang, pattern)| Regex::new(pattern).ok().map(|regex| (lang, regex)))
    .collect()
});

const TECH_KEYWORDS: &[(&str, &[&str])] = &[
    ("react", &["react", "jsx", "component", "usestate", "useeffect", "props"]),
    ("vue", &["vue", "v-model", "v-if", "v-for", "computed", "mounted"]),
    ("angular", &["angular", "ngmodel", "ngif", "ngfor", "component", "service"]),
    ("nextjs", &["next.js", "nextjs", "getserversideprops", "getstaticprops"]),
    ("nodejs", &["node.js", "nodejs", "express", "npm", "package.json"]),
    ("django", &["django", "models.py", "views.py", "urls.py", "migrations"]),
    ("flask", &["flask", "app.route", "render_template", "request"]),
    ("docker", &["docker", "dockerfile", "container", "image", "compose"]),
    ("kubernetes", &["kubernetes", "k8s", "kubectl", "pod", "deployment"]),
    ("aws", &["aws", "ec2", "s3", "lambda", "dynamodb", "cloudformation"]),
    ("azure", &["azure", "blob storage", "functions", "cosmos db"]),
    ("gcp", &["google cloud", "gcp", "bigquery", "firestore", "cloud run"]),
];

const CODING: &[&str] = &["code", "function", "algorithm", "debug", "implement", "fix", "error", "bug"];
const WRITING: &[&str] = &["write", "article", "blog", "essay", "story", "content", "copy"];
const ANALYSIS: &[&str] = &["analyze", "evaluate", "compare", "assess", "review", "examine"];
const RESEARCH: &[&str] = &["research", "study", "investigate", "explore", "sources", "citations"];
const CREATIVE: &[&str] = &["creative", "imagine", "story", "poem", "design", "brainstorm"];
const TRANSLATION: &[&str] = &[
    "translate",
    "translation",
    "language",
    "convert to",
    "in spanish",
    "in french",
];
const SUMMARIZATION: &[&str] = &["summarize", "summary", "tldr", "brief", "overview", "key points"];
const CONVERSATION: &[&str] = &["chat", "discuss", "talk", "conversation", "dialogue"];

const DOMAIN_INDICATORS: &[(&str, &[&str])] = &[
    ("coding", CODING),
    ("writing", WRITING),
    ("analysis", ANALYSIS),
    ("research", RESEARCH),
    ("creative", CREATIVE),
    ("translation", TRANSLATION),
    ("summarization", SUMMARIZATION),
    ("conversation", CONVERSATION),
];

fn mentions_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

pub fn analyze(prompt: &str, attachments: &[Attachment]) -> PromptAnalysis {
    let lower = prompt.to_lowercase();
    let word_count = prompt.split_whitespace().count();
    let char_count = prompt.chars().count();

    let has_code = CODE_PATTERNS.iter().any(|pattern| pattern.is_match(prompt));
    let tech_stack = detect_tech_stack(&lower);
    let content_type = determine_content_type(&lower, has_code);
    let domain = determine_domain(&lower);
    let complexity = calculate_complexity(word_count, has_code, tech_stack.len());
    let required_features = required_features(prompt, attachments);
    let estimated_tokens = (char_count as f64 / 3.5).ceil() as u64;

    PromptAnalysis {
        complexity,
        content_type,
        word_count,
        has_code,
        has_images: attachments.iter().any(Attachment::is_image),
        has_files: !attachments.is_empty(),
        language: detect_language(prompt),
        domain,
        required_capabilities: required_capabilities(&required_features, content_type),
        tech_stack,
        required_features,
        min_context_window: min_context_window(estimated_tokens, attachments.len()),
        estimated_tokens,
        accuracy_needed: accuracy_needed(content_type, domain),
        creativity_needed: creativity_needed(content_type, domain),
        speed_priority: speed_priority(&lower),
        budget_sensitivity: budget_sensitivity(&lower),
        quality_threshold: quality_threshold(content_type, domain),
    }
}

fn detect_tech_stack(prompt: &str) -> Vec<&'static str> {
    TECH_KEYWORDS
        .iter()
        .filter(|(_, keywords)| mentions_any(prompt, keywords))
        .map(|(tech, _)| *tech)
        .collect()
}

fn determine_content_type(prompt: &str, has_code: bool) -> ContentType {
    if has_code {
        return ContentType::Code;
    }

    let candidates = [
        (ContentType::Creative, CREATIVE, 3),
        (ContentType::Analysis, ANALYSIS, 3),
        (ContentType::Research, RESEARCH, 3),
        (ContentType::Translation, TRANSLATION, 3),
        (ContentType::Summarization, SUMMARIZATION, 3),
        (ContentType::Conversation, CONVERSATION, 2),
    ];

    let mut selected = ContentType::General;
    let mut best = 0;
    for (content_type, indicators, score) in candidates {
        if score > best && mentions_any(prompt, indicators) {
            best = score;
            selected = content_type;
        }
    }
    selected
}

fn determine_domain(prompt: &str) -> Option<&'static str> {
    DOMAIN_INDICATORS
        .iter()
        .find(|(_, indicators)| mentions_any(prompt, indicators))
        .map(|(domain, _)| *domain)
}

fn calculate_complexity(word_count: usize, has_code: bool, tech_count: usize) -> Complexity {
    let mut score = match word_count {
        count if count > 500 => 3,
        count if count > 200 => 2,
        count if count > 100 => 1,
        _ => 0,
    };
    if has_code {
        score += 2;
    }
    score += tech_count;

    match score {
        s if s >= 6 => Complexity::Expert,
        s if s >= 4 => Complexity::Complex,
        s if s >= 2 => Complexity::Moderate,
        _ => Complexity::Simple,
    }
}

fn required_features(prompt: &str, attachments: &[Attachment]) -> Vec<&'static str> {
    let mut features = Vec::new();

    if attachments.iter().any(Attachment::is_image)
        || prompt.contains("image")
        || prompt.contains("picture")
    {
        features.push("vision");
    }
    if mentions_any(prompt, &["search", "browse", "web"]) {
        features.push("web_search");
    }
    if mentions_any(prompt, &["run", "execute", "test"]) {
        features.push("code_execution");
    }
    if mentions_any(prompt, &["explain", "why", "how"]) {
        features.push("reasoning");
    }
    let arithmetic = ARITHMETIC
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(prompt));
    if arithmetic || mentions_any(prompt, &["calculate", "math"]) {
        features.push("math");
    }

    features
}

fn required_capabilities(features: &[&str], content_type: ContentType) -> Vec<&'static str> {
    let mut capabilities = Vec::new();

    for (feature, capability) in [
        ("vision", "image_understanding"),
        ("web_search", "web_browsing"),
        ("code_execution", "code_interpreter"),
        ("reasoning", "chain_of_thought"),
        ("math", "mathematical_reasoning"),
    ] {
        if features.contains(&feature) {
            capabilities.push(capability);
        }
    }

    match content_type {
        ContentType::Code => capabilities.extend(["code_generation", "syntax_highlighting"]),
        ContentType::Creative => capabilities.push("creative_writing"),
        ContentType::Analysis => capabilities.push("data_analysis"),
        _ => {}
    }

    capabilities
}

/// Smallest standard context window that fits three times the prompt.
fn min_context_window(estimated_tokens: u64, attachment_count: usize) -> u64 {
    let base = 4096 + attachment_count as u64 * 1000;
    let window = base.max(estimated_tokens * 3);

    match window {
        w if w > 128_000 => 200_000,
        w if w > 32_000 => 128_000,
        w if w > 16_000 => 32_000,
        w if w > 8_000 => 16_000,
        w if w > 4_000 => 8_192,
        _ => 4_096,
    }
}

fn accuracy_needed(content_type: ContentType, domain: Option<&str>) -> f64 {
    match content_type {
        ContentType::Code => 0.9,
        ContentType::Analysis => 0.85,
        ContentType::Research => 0.8,
        _ if domain == Some("coding") => 0.85,
        ContentType::Summarization => 0.7,
        ContentType::Translation => 0.75,
        ContentType::Creative => 0.5,
        ContentType::Conversation => 0.6,
        ContentType::General => 0.7,
    }
}

fn creativity_needed(content_type: ContentType, domain: Option<&str>) -> f64 {
    match content_type {
        ContentType::Creative => 0.9,
        _ if domain == Some("creative") => 0.85,
        ContentType::Conversation => 0.6,
        ContentType::Code | ContentType::Analysis => 0.3,
        ContentType::Research | ContentType::Translation => 0.2,
        _ => 0.5,
    }
}

fn speed_priority(prompt: &str) -> f64 {
    if mentions_any(prompt, &["quick", "fast", "briefly"]) {
        0.8
    } else if mentions_any(prompt, &["detailed", "comprehensive", "thorough"]) {
        0.3
    } else {
        0.5
    }
}

fn budget_sensitivity(prompt: &str) -> f64 {
    if mentions_any(prompt, &["cheap", "budget", "economical"]) {
        0.9
    } else if mentions_any(prompt, &["best", "highest quality", "most accurate"]) {
        0.2
    } else {
        0.5
    }
}

fn quality_threshold(content_type: ContentType, domain: Option<&str>) -> f64 {
    match content_type {
        ContentType::Code => 0.8,
        ContentType::Analysis | ContentType::Research => 0.75,
        _ if domain == Some("coding") => 0.8,
        ContentType::Translation => 0.7,
        ContentType::Summarization => 0.65,
        ContentType::Conversation | ContentType::Creative => 0.5,
        ContentType::General => 0.6,
    }
}

fn detect_language(text: &str) -> &'static str {
    LANGUAGE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.find_iter(text).count() > 3)
        .map(|(lang, _)| *lang)
        .unwrap_or("en")
}
