//! Query analysis: intent, scope, decomposition, and synonym expansion
//!
//! The analyser asks the LLM gateway for a structured JSON record and falls
//! back to deterministic heuristics (regex intents, keyword maps, scope
//! words) whenever the LLM is unavailable or returns something unparseable.

use crate::config::ConversationConfig;
use crate::error::Result;
use crate::llm::LlmGateway;
use crate::types::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// User intent tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Goodbye,
    Help,
    InformationSeeking,
    Question,
    FollowUp,
    Command,
    Unknown,
}

/// Query complexity bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Structural query type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Single,
    Multi,
    Aggregation,
}

/// Scope of the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Specific,
    All,
    Range,
}

/// Requested action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    List,
    Count,
    Find,
    Compare,
    Identify,
}

/// Full analysis record for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub intent: Intent,
    pub complexity: Complexity,
    pub query_type: QueryType,
    pub needs_decomposition: bool,
    pub entity_type: Option<String>,
    pub scope: Scope,
    pub scope_targets: Vec<String>,
    pub action: Option<ActionType>,
    pub filters: Metadata,
    pub decomposed_queries: Vec<String>,
    pub keywords: Vec<String>,
    pub synonyms: HashMap<String, Vec<String>>,
    pub person_entities: Vec<String>,
    pub is_contextual: bool,
}

impl Default for QueryAnalysis {
    fn default() -> Self {
        Self {
            intent: Intent::Unknown,
            complexity: Complexity::Simple,
            query_type: QueryType::Single,
            needs_decomposition: false,
            entity_type: None,
            scope: Scope::Specific,
            scope_targets: Vec::new(),
            action: None,
            filters: Metadata::new(),
            decomposed_queries: Vec::new(),
            keywords: Vec::new(),
            synonyms: HashMap::new(),
            person_entities: Vec::new(),
            is_contextual: false,
        }
    }
}

/// Partial record parsed from the LLM's JSON answer
#[derive(Debug, Default, Deserialize)]
struct LlmAnalysisRaw {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    query_type: Option<String>,
    #[serde(default)]
    needs_decomposition: Option<bool>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scope_targets: Vec<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    filters: HashMap<String, String>,
    #[serde(default)]
    decomposed_queries: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "in", "on", "at", "of", "for", "to", "and",
    "or", "with", "about", "what", "which", "who", "how", "many", "much", "all", "any", "do",
    "does", "did", "can", "could", "please", "me", "my", "you", "your", "there", "this", "that",
    "it", "its", "be", "been", "have", "has", "had", "from", "by",
];

const PERSON_KEYWORDS: &[&str] = &[
    "employee", "manager", "staff", "person", "people", "who", "works", "role", "department",
    "team", "contact", "email", "phone",
];

const MONTHS: &[(&str, &str)] = &[
    ("january", "-01-"),
    ("february", "-02-"),
    ("march", "-03-"),
    ("april", "-04-"),
    ("may", "-05-"),
    ("june", "-06-"),
    ("july", "-07-"),
    ("august", "-08-"),
    ("september", "-09-"),
    ("october", "-10-"),
    ("november", "-11-"),
    ("december", "-12-"),
];

/// Query analyser over the LLM gateway with deterministic fallback
pub struct QueryAnalyzer {
    gateway: Option<Arc<LlmGateway>>,
    config: ConversationConfig,
}

impl QueryAnalyzer {
    pub fn new(gateway: Option<Arc<LlmGateway>>, config: ConversationConfig) -> Self {
        Self { gateway, config }
    }

    /// Analyse a query; never fails, the fallback always produces a record
    pub async fn analyze(&self, query: &str) -> QueryAnalysis {
        if query.trim().is_empty() {
            return QueryAnalysis::default();
        }

        if self.config.enable_llm_query_analysis {
            if let Some(gateway) = &self.gateway {
                match self.analyze_with_llm(gateway, query).await {
                    Ok(analysis) => return analysis,
                    Err(e) => {
                        warn!("LLM query analysis failed, using heuristics: {}", e);
                    }
                }
            }
        }

        self.heuristic_analyze(query)
    }

    async fn analyze_with_llm(
        &self,
        gateway: &Arc<LlmGateway>,
        query: &str,
    ) -> Result<QueryAnalysis> {
        let prompt = format!(
            "Analyze this search query and answer with a single JSON object, no prose.\n\
             Fields: intent (greeting|goodbye|help|information_seeking|question|follow_up|command|unknown), \
             complexity (simple|moderate|complex), query_type (single|multi|aggregation), \
             needs_decomposition (bool), entity_type (string or null), \
             scope (specific|all|range), scope_targets (string array), \
             action (list|count|find|compare|identify or null), \
             filters (string map), decomposed_queries (string array), keywords (string array).\n\n\
             Query: {}",
            query
        );

        let answer = gateway.generate(&prompt).await?;
        let raw: LlmAnalysisRaw = serde_json::from_str(extract_json(&answer))?;

        // Start from heuristics so missing fields keep sane values
        let mut analysis = self.heuristic_analyze(query);

        if let Some(intent) = raw.intent.as_deref().and_then(parse_intent) {
            analysis.intent = intent;
        }
        if let Some(complexity) = raw.complexity.as_deref().and_then(parse_complexity) {
            analysis.complexity = complexity;
        }
        if let Some(query_type) = raw.query_type.as_deref().and_then(parse_query_type) {
            analysis.query_type = query_type;
        }
        if let Some(needs) = raw.needs_decomposition {
            analysis.needs_decomposition = needs && self.config.enable_query_decomposition;
        }
        if raw.entity_type.is_some() {
            analysis.entity_type = raw.entity_type;
        }
        if let Some(scope) = raw.scope.as_deref().and_then(parse_scope) {
            analysis.scope = scope;
        }
        if !raw.scope_targets.is_empty() {
            analysis.scope_targets = raw.scope_targets;
        }
        if let Some(action) = raw.action.as_deref().and_then(parse_action) {
            analysis.action = Some(action);
        }
        for (key, value) in raw.filters {
            analysis.filters.insert(key, json!(value));
        }
        if !raw.decomposed_queries.is_empty() {
            analysis.decomposed_queries = raw.decomposed_queries;
            analysis
                .decomposed_queries
                .truncate(self.config.max_decomposed_queries);
        }
        if !raw.keywords.is_empty() {
            analysis.keywords = raw.keywords;
        }

        Ok(analysis)
    }

    /// Deterministic analysis used whenever the LLM path is off or broken
    pub fn heuristic_analyze(&self, query: &str) -> QueryAnalysis {
        let trimmed = query.trim();
        let lower = trimmed.to_lowercase();
        let mut analysis = QueryAnalysis {
            intent: detect_intent(&lower, trimmed),
            ..QueryAnalysis::default()
        };

        analysis.keywords = extract_keywords(&lower);
        analysis.person_entities = extract_person_entities(trimmed);
        analysis.is_contextual = detect_contextual(&lower);
        analysis.entity_type = detect_entity_type(&lower, &analysis.person_entities);
        analysis.action = detect_action(&lower);
        analysis.scope = detect_scope(&lower);
        analysis.scope_targets = extract_scope_targets(trimmed);

        if self.config.synonym_expansion_enabled {
            analysis.synonyms = build_synonyms(&analysis.keywords);
        }

        if self.config.enable_aggregation_detection && is_aggregation(&lower) {
            analysis.query_type = QueryType::Aggregation;
            analysis.action = Some(ActionType::Count);
            for (month, pattern) in MONTHS {
                if lower.contains(month) {
                    analysis
                        .filters
                        .insert("created_date".to_string(), json!(pattern));
                    break;
                }
            }
            static YEAR: OnceLock<regex::Regex> = OnceLock::new();
            let year = YEAR.get_or_init(|| regex::Regex::new(r"\b(19|20)\d{2}\b").unwrap());
            if let Some(m) = year.find(&lower) {
                analysis
                    .filters
                    .insert("created_year".to_string(), json!(m.as_str()));
            }
        } else if self.config.enable_query_decomposition {
            let sub_queries = decompose(trimmed, self.config.max_decomposed_queries);
            if sub_queries.len() > 1 {
                analysis.query_type = QueryType::Multi;
                analysis.needs_decomposition = true;
                analysis.decomposed_queries = sub_queries;
            }
        }

        analysis.complexity = if analysis.needs_decomposition
            || analysis.query_type == QueryType::Aggregation
        {
            Complexity::Complex
        } else if trimmed.split_whitespace().count() >= 12 || lower.contains(" and ") {
            Complexity::Moderate
        } else {
            Complexity::Simple
        };

        debug!(
            "Heuristic analysis: intent={:?}, type={:?}, entity={:?}, decompose={}",
            analysis.intent, analysis.query_type, analysis.entity_type, analysis.needs_decomposition
        );
        analysis
    }
}

fn detect_intent(lower: &str, original: &str) -> Intent {
    static GREETING: OnceLock<regex::Regex> = OnceLock::new();
    static GOODBYE: OnceLock<regex::Regex> = OnceLock::new();
    static HELP: OnceLock<regex::Regex> = OnceLock::new();
    let greeting = GREETING.get_or_init(|| {
        regex::Regex::new(r"^(hi|hello|hey|good\s+(morning|afternoon|evening))\b").unwrap()
    });
    let goodbye = GOODBYE
        .get_or_init(|| regex::Regex::new(r"\b(bye|goodbye|see\s+you|farewell|exit|quit)\b").unwrap());
    let help =
        HELP.get_or_init(|| regex::Regex::new(r"^(help|what\s+can\s+you\s+do)\b").unwrap());

    if greeting.is_match(lower) {
        return Intent::Greeting;
    }
    if goodbye.is_match(lower) {
        return Intent::Goodbye;
    }
    if help.is_match(lower) {
        return Intent::Help;
    }

    let question_starters = [
        "who", "what", "when", "where", "why", "how", "which", "is ", "are ", "do ", "does ",
        "can ", "could ",
    ];
    if original.ends_with('?') || question_starters.iter().any(|s| lower.starts_with(s)) {
        return Intent::Question;
    }

    let command_starters = ["list", "show", "find", "get", "count", "give", "display"];
    if command_starters.iter().any(|s| lower.starts_with(s)) {
        return Intent::Command;
    }

    if detect_contextual(lower) && lower.split_whitespace().count() <= 6 {
        return Intent::FollowUp;
    }

    if lower.split_whitespace().count() >= 3 {
        Intent::InformationSeeking
    } else {
        Intent::Unknown
    }
}

fn detect_contextual(lower: &str) -> bool {
    lower.starts_with("what about")
        || lower.starts_with("and ")
        || lower.starts_with("how about")
        || ["it", "that", "they", "them", "those", "these"]
            .iter()
            .any(|p| {
                lower.split_whitespace().any(|w| w == *p)
            })
}

fn extract_keywords(lower: &str) -> Vec<String> {
    lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() >= 2 && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

fn extract_person_entities(text: &str) -> Vec<String> {
    static PAIR: OnceLock<regex::Regex> = OnceLock::new();
    let pair = PAIR
        .get_or_init(|| regex::Regex::new(r"\b([A-Z][a-z]+)\s+([A-Z][a-z]+)\b").unwrap());

    let non_names = [
        "The", "What", "When", "Where", "Which", "How", "Who", "Building", "Floor", "List",
        "Show", "Find", "Access", "Network", "Service",
    ];

    pair.captures_iter(text)
        .filter(|caps| {
            !non_names.contains(&&caps[1]) && !non_names.contains(&&caps[2])
        })
        .map(|caps| format!("{} {}", &caps[1], &caps[2]))
        .collect()
}

fn detect_entity_type(lower: &str, person_entities: &[String]) -> Option<String> {
    if !person_entities.is_empty()
        || PERSON_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() >= 2
    {
        return Some("person".to_string());
    }

    let maps: [(&str, &[&str]); 4] = [
        (
            "network",
            &["ap ", " ap", "access point", "router", "switch", "wifi", "wireless", "network"],
        ),
        (
            "incident",
            &["incident", "ticket", "outage", "problem", "alert"],
        ),
        ("building", &["building", "floor", "site", "location"]),
        ("document", &["document", "file", "report", "manual"]),
    ];

    for (entity, terms) in maps {
        if terms.iter().any(|t| lower.contains(t)) {
            return Some(entity.to_string());
        }
    }
    None
}

fn detect_action(lower: &str) -> Option<ActionType> {
    if lower.starts_with("how many") || lower.contains("count of") || lower.contains("number of") {
        Some(ActionType::Count)
    } else if lower.starts_with("list") || lower.starts_with("show") || lower.starts_with("display")
    {
        Some(ActionType::List)
    } else if lower.contains("compare") || lower.contains(" versus ") || lower.contains(" vs ") {
        Some(ActionType::Compare)
    } else if lower.starts_with("who is") || lower.starts_with("identify") {
        Some(ActionType::Identify)
    } else if lower.starts_with("find") || lower.starts_with("locate") || lower.starts_with("search")
    {
        Some(ActionType::Find)
    } else {
        None
    }
}

fn detect_scope(lower: &str) -> Scope {
    if lower.contains("between") && lower.contains(" and ") {
        Scope::Range
    } else if lower.contains(" all ")
        || lower.starts_with("all ")
        || lower.contains("list all")
        || lower.contains(" every ")
    {
        Scope::All
    } else {
        Scope::Specific
    }
}

fn extract_scope_targets(text: &str) -> Vec<String> {
    static TARGET: OnceLock<regex::Regex> = OnceLock::new();
    let target = TARGET.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(building|floor|site|zone)\s+([A-Za-z0-9]+)").unwrap()
    });

    target
        .captures_iter(text)
        .map(|caps| format!("{} {}", &caps[1], &caps[2]))
        .collect()
}

fn is_aggregation(lower: &str) -> bool {
    lower.starts_with("how many")
        || lower.starts_with("count")
        || lower.contains("number of")
        || lower.contains("total number")
}

/// Split "X in A and B" into per-target sub-queries; fall back to clause
/// splitting on " and also "
fn decompose(query: &str, max: usize) -> Vec<String> {
    static IN_TARGETS: OnceLock<regex::Regex> = OnceLock::new();
    let in_targets = IN_TARGETS
        .get_or_init(|| regex::Regex::new(r"(?i)^(.+?)\s+in\s+(.+)$").unwrap());

    if let Some(caps) = in_targets.captures(query) {
        let head = caps[1].trim().to_string();
        let tail = &caps[2];
        if tail.to_lowercase().contains(" and ") {
            static AND_SPLIT: OnceLock<regex::Regex> = OnceLock::new();
            let and_split =
                AND_SPLIT.get_or_init(|| regex::Regex::new(r"(?i)\s+and\s+").unwrap());
            let targets: Vec<&str> = and_split.split(tail).map(|t| t.trim()).collect();
            if targets.len() > 1 {
                let mut sub_queries: Vec<String> = targets
                    .into_iter()
                    .filter(|t| !t.is_empty())
                    .map(|t| format!("{} in {}", head, t))
                    .collect();
                sub_queries.truncate(max);
                return sub_queries;
            }
        }
    }

    let clauses: Vec<String> = query
        .split(" and also ")
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if clauses.len() > 1 {
        let mut clauses = clauses;
        clauses.truncate(max);
        return clauses;
    }

    vec![query.to_string()]
}

fn build_synonyms(keywords: &[String]) -> HashMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 7] = [
        ("ap", &["access point", "wireless ap", "wap"]),
        ("access", &["ap"]),
        ("switch", &["network switch"]),
        ("server", &["host", "machine"]),
        ("incident", &["ticket", "issue"]),
        ("employee", &["staff", "team member"]),
        ("router", &["gateway"]),
    ];

    let mut synonyms = HashMap::new();
    for keyword in keywords {
        for (term, expansions) in &table {
            if keyword == term {
                synonyms.insert(
                    keyword.clone(),
                    expansions.iter().map(|s| s.to_string()).collect(),
                );
            }
        }
    }
    synonyms
}

fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed);

    // Take the outermost object if the model added prose around it
    match (without_fence.find('{'), without_fence.rfind('}')) {
        (Some(start), Some(end)) if end > start => &without_fence[start..=end],
        _ => without_fence,
    }
}

fn parse_intent(s: &str) -> Option<Intent> {
    match s {
        "greeting" => Some(Intent::Greeting),
        "goodbye" => Some(Intent::Goodbye),
        "help" => Some(Intent::Help),
        "information_seeking" => Some(Intent::InformationSeeking),
        "question" => Some(Intent::Question),
        "follow_up" => Some(Intent::FollowUp),
        "command" => Some(Intent::Command),
        "unknown" => Some(Intent::Unknown),
        _ => None,
    }
}

fn parse_complexity(s: &str) -> Option<Complexity> {
    match s {
        "simple" => Some(Complexity::Simple),
        "moderate" => Some(Complexity::Moderate),
        "complex" => Some(Complexity::Complex),
        _ => None,
    }
}

fn parse_query_type(s: &str) -> Option<QueryType> {
    match s {
        "single" => Some(QueryType::Single),
        "multi" => Some(QueryType::Multi),
        "aggregation" => Some(QueryType::Aggregation),
        _ => None,
    }
}

fn parse_scope(s: &str) -> Option<Scope> {
    match s {
        "specific" => Some(Scope::Specific),
        "all" => Some(Scope::All),
        "range" => Some(Scope::Range),
        _ => None,
    }
}

fn parse_action(s: &str) -> Option<ActionType> {
    match s {
        "list" => Some(ActionType::List),
        "count" => Some(ActionType::Count),
        "find" => Some(ActionType::Find),
        "compare" => Some(ActionType::Compare),
        "identify" => Some(ActionType::Identify),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(
            None,
            ConversationConfig {
                enable_llm_query_analysis: false,
                ..ConversationConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_greeting_intent() {
        let analysis = analyzer().analyze("Hello there!").await;
        assert_eq!(analysis.intent, Intent::Greeting);
    }

    #[tokio::test]
    async fn test_goodbye_intent() {
        let analysis = analyzer().analyze("ok bye now").await;
        assert_eq!(analysis.intent, Intent::Goodbye);
    }

    #[tokio::test]
    async fn test_question_intent_and_keywords() {
        let analysis = analyzer().analyze("What is the capital of France?").await;
        assert_eq!(analysis.intent, Intent::Question);
        assert!(analysis.keywords.contains(&"capital".to_string()));
        assert!(analysis.keywords.contains(&"france".to_string()));
        assert!(!analysis.keywords.contains(&"the".to_string()));
    }

    #[tokio::test]
    async fn test_decomposition_across_locations() {
        let analysis = analyzer()
            .analyze("List all AP models in Building A and Building B")
            .await;
        assert_eq!(analysis.query_type, QueryType::Multi);
        assert!(analysis.needs_decomposition);
        assert_eq!(analysis.decomposed_queries.len(), 2);
        assert!(analysis.decomposed_queries[0].contains("Building A"));
        assert!(analysis.decomposed_queries[1].contains("Building B"));
        assert_eq!(analysis.scope, Scope::All);
        assert_eq!(analysis.entity_type.as_deref(), Some("network"));
    }

    #[tokio::test]
    async fn test_aggregation_detection_with_month_filter() {
        let analysis = analyzer()
            .analyze("How many incidents were created in December?")
            .await;
        assert_eq!(analysis.query_type, QueryType::Aggregation);
        assert_eq!(analysis.action, Some(ActionType::Count));
        assert_eq!(
            analysis.filters.get("created_date").and_then(|v| v.as_str()),
            Some("-12-")
        );
        assert_eq!(analysis.complexity, Complexity::Complex);
    }

    #[tokio::test]
    async fn test_person_entities() {
        let analysis = analyzer().analyze("What is the role of Maria Garcia?").await;
        assert_eq!(analysis.person_entities, vec!["Maria Garcia".to_string()]);
        assert_eq!(analysis.entity_type.as_deref(), Some("person"));
    }

    #[tokio::test]
    async fn test_synonym_expansion() {
        let analysis = analyzer().analyze("show ap inventory").await;
        assert!(analysis.synonyms.contains_key("ap"));
        assert!(analysis.synonyms["ap"].contains(&"access point".to_string()));
    }

    #[tokio::test]
    async fn test_contextual_follow_up() {
        let analysis = analyzer().analyze("what about that one").await;
        assert!(analysis.is_contextual);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let analysis = analyzer().analyze("   ").await;
        assert_eq!(analysis.intent, Intent::Unknown);
        assert!(analysis.keywords.is_empty());
    }

    #[test]
    fn test_extract_json_from_fenced_answer() {
        let fenced = "```json\n{\"intent\": \"question\"}\n```";
        let parsed: serde_json::Value = serde_json::from_str(extract_json(fenced)).unwrap();
        assert_eq!(parsed["intent"], "question");

        let chatty = "Sure! Here you go: {\"intent\": \"command\"} Hope that helps.";
        let parsed: serde_json::Value = serde_json::from_str(extract_json(chatty)).unwrap();
        assert_eq!(parsed["intent"], "command");
    }

    #[test]
    fn test_scope_targets() {
        let targets = extract_scope_targets("List APs in Building A and Building B");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], "Building A");
    }
}
