//! `{{ expression }}` substitution for notification templates.
//!
//! An expression is a dotted path into the variables, a literal, or a helper
//! call written either as `helper(arg, arg)` or `helper arg arg`. Arguments may
//! themselves be parenthesised expressions, so
//! `{{formatPercent (multiply (divide context.currentCost context.threshold) 100)}}`
//! works. Anything that cannot be resolved is left in place untouched.
//!
//! `{{#if expr}}…{{else}}…{{/if}}` blocks keep one branch depending on the
//! truthiness of `expr`, and may nest.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};

static PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\{\{([^}]+)\}\}").ok());
static VALID_EXPRESSION: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"^[\w.()\s,"']+$"#).ok());

const BLOCK_START: &str = "{{#if";

pub fn render(template: &str, variables: &Value) -> String {
    let expanded = render_blocks(template, variables);
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return expanded;
    };

    placeholder
        .replace_all(&expanded, |caps: &Captures<'_>| {
            match evaluate(caps[1].trim(), variables) {
                Some(value) => display(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn render_blocks(template: &str, variables: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(BLOCK_START) {
        out.push_str(&rest[..start]);
        let Some(block) = parse_block(&rest[start..]) else {
            out.push_str(BLOCK_START);
            rest = &rest[start + BLOCK_START.len()..];
            continue;
        };
        let truthy = evaluate(block.condition, variables).is_some_and(|value| is_truthy(&value));
        let branch = if truthy { block.then } else { block.otherwise };
        out.push_str(&render_blocks(branch, variables));
        rest = &rest[start + block.len..];
    }

    out.push_str(rest);
    out
}

struct Block<'a> {
    condition: &'a str,
    then: &'a str,
    otherwise: &'a str,
    /// Bytes from `{{#if` through the matching `{{/if}}`.
    len: usize,
}

/// Parses the `{{#if}}` block that starts `input`, `None` when it is never closed.
fn parse_block(input: &str) -> Option<Block<'_>> {
    let header_end = input.find("}}")?;
    let condition = input[BLOCK_START.len()..header_end].trim_end();
    if !condition.is_empty() && !condition.starts_with(char::is_whitespace) {
        return None;
    }

    let body_start = header_end + 2;
    let mut depth = 0usize;
    let mut else_tag: Option<(usize, usize)> = None;
    let mut cursor = body_start;
    while let Some(offset) = input[cursor..].find("{{") {
        let tag_start = cursor + offset;
        let tag_end = tag_start + input[tag_start..].find("}}")? + 2;
        let tag = input[tag_start + 2..tag_end - 2].trim();

        if tag.starts_with("#if") {
            depth += 1;
        } else if tag == "/if" {
            if depth == 0 {
                let then_end = else_tag.map_or(tag_start, |(start, _)| start);
                return Some(Block {
                    condition: condition.trim(),
                    then: &input[body_start..then_end],
                    otherwise: else_tag.map_or("", |(_, end)| &input[end..tag_start]),
                    len: tag_end,
                });
            }
            depth -= 1;
        } else if tag == "else" && depth == 0 && else_tag.is_none() {
            else_tag = Some((tag_start, tag_end));
        }
        cursor = tag_end;
    }
    None
}

/// Syntax problems in `template`, empty when it is well formed.
pub fn validate(template: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let opening = template.matches("{{").count();
    let closing = template.matches("}}").count();
    if opening != closing {
        errors.push(format!(
            "Mismatched braces: {opening} opening, {closing} closing"
        ));
    }

    let blocks_opened = template.matches(BLOCK_START).count();
    let blocks_closed = template.matches("{{/if}}").count();
    if blocks_opened != blocks_closed {
        errors.push(format!(
            "Unbalanced if blocks: {blocks_opened} opening, {blocks_closed} closing"
        ));
    }

    if let (Some(placeholder), Some(valid)) = (PLACEHOLDER.as_ref(), VALID_EXPRESSION.as_ref()) {
        for caps in placeholder.captures_iter(template) {
            let expression = caps[1].trim();
            if expression == "else" || expression == "/if" {
                continue;
            }
            let checked = expression.strip_prefix("#if").map_or(expression, str::trim);
            if checked.is_empty() || !valid.is_match(checked) {
                errors.push(format!("Invalid expression: {expression}"));
            }
        }
    }

    errors
}

/// Layers a template's brand settings under `branding`; caller supplied
/// branding keys win.
pub fn with_branding(variables: &Value, brand: &Value) -> Value {
    let mut merged = match variables {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let mut branding = match brand {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(overrides)) = merged.get("branding") {
        for (key, value) in overrides {
            branding.insert(key.clone(), value.clone());
        }
    }

    merged.insert("branding".to_string(), Value::Object(branding));
    Value::Object(merged)
}

/// Sample data used by template previews.
pub fn preview_variables(notification_type: &str) -> Value {
    json!({
        "user": {
            "id": "preview-user-id",
            "name": "John Doe",
            "email": "john.doe@example.com",
            "company": "Example Corp"
        },
        "organization": {
            "id": "preview-org-id",
            "name": "Example Corporation",
            "domain": "example.com"
        },
        "notification": {
            "type": notification_type,
            "priority": "MEDIUM",
            "title": "Preview Notification",
            "message": "This is a preview of your notification template.",
            "data": { "sampleData": true }
        },
        "context": {
            "currentCost": 150.75,
            "threshold": 100,
            "provider": "openai",
            "model": "gpt-4",
            "timeframe": "Last 24 hours",
            "timestamp": crate::util::now_rfc3339()
        },
        "branding": {
            "primaryColor": "#3b82f6",
            "logoUrl": "https://example.com/logo.png",
            "companyName": "AI Cost Guardian",
            "brandName": "AI Cost Guardian",
            "footerText": "Manage your AI costs intelligently"
        }
    })
}

fn evaluate(expression: &str, variables: &Value) -> Option<Value> {
    let expression = expression.trim();
    if expression.is_empty() {
        return None;
    }

    if let Some(inner) = enclosed(expression) {
        return evaluate(inner, variables);
    }

    if let Some(value) = literal(expression) {
        return Some(value);
    }

    if let Some((name, args)) = call_form(expression) {
        let args: Vec<Option<Value>> = split_args(args, ',')
            .iter()
            .map(|arg| evaluate(arg, variables))
            .collect();
        return apply_helper(name, &args);
    }

    let tokens = split_args(expression, ' ');
    if tokens.len() > 1 {
        let args: Vec<Option<Value>> = tokens[1..]
            .iter()
            .map(|arg| evaluate(arg, variables))
            .collect();
        return apply_helper(&tokens[0], &args);
    }

    lookup(variables, expression)
}

/// The inside of `( … )` when the outer parentheses wrap the whole expression.
fn enclosed(expression: &str) -> Option<&str> {
    if !expression.starts_with('(') {
        return None;
    }
    (closing_paren(expression, 0)? == expression.len() - 1)
        .then(|| &expression[1..expression.len() - 1])
}

/// `name(args)` where the call's closing parenthesis ends the expression.
fn call_form(expression: &str) -> Option<(&str, &str)> {
    let open = expression.find('(')?;
    let name = expression[..open].trim_end();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let close = closing_paren(expression, open)?;
    (close == expression.len() - 1).then(|| (name, &expression[open + 1..close]))
}

fn closing_paren(expression: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote = None;
    for (index, c) in expression.char_indices().skip_while(|(i, _)| *i < open) {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits on `separator` (any whitespace for `' '`) outside quotes and parentheses.
fn split_args(input: &str, separator: char) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote = None;

    for c in input.chars() {
        let is_separator = if separator == ' ' {
            c.is_whitespace()
        } else {
            c == separator
        };

        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == '(' => {
                depth += 1;
                current.push(c);
            }
            None if c == ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            None if is_separator && depth == 0 => {
                if !current.trim().is_empty() {
                    args.push(current.trim().to_string());
                }
                current.clear();
            }
            None => current.push(c),
        }
    }

    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn literal(expression: &str) -> Option<Value> {
    for quote in ['"', '\''] {
        if expression.len() >= 2 && expression.starts_with(quote) && expression.ends_with(quote) {
            return Some(Value::String(expression[1..expression.len() - 1].to_string()));
        }
    }
    expression.parse::<f64>().ok().map(number_value)
}

fn lookup(variables: &Value, path: &str) -> Option<Value> {
    let mut current = variables;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!current.is_null()).then(|| current.clone())
}

fn apply_helper(name: &str, args: &[Option<Value>]) -> Option<Value> {
    let arg = |index: usize| args.get(index).cloned().flatten();
    let number = |index: usize| arg(index).as_ref().and_then(as_number);
    let text = |index: usize| arg(index).map(|value| display(&value)).unwrap_or_default();

    let value = match name {
        "formatCurrency" => Value::String(format_currency(number(0).unwrap_or(0.0))),
        "formatNumber" => {
            let decimals = number(1).map(|d| d.max(0.0) as usize).unwrap_or(0);
            Value::String(format_number(number(0).unwrap_or(0.0), decimals))
        }
        "formatPercent" => {
            let decimals = number(1).map(|d| d.max(0.0) as usize).unwrap_or(1);
            Value::String(format!(
                "{}%",
                format_number(number(0).unwrap_or(0.0), decimals)
            ))
        }
        "upper" => Value::String(text(0).to_uppercase()),
        "lower" => Value::String(text(0).to_lowercase()),
        "capitalize" => {
            let text = text(0);
            let mut chars = text.chars();
            Value::String(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            })
        }
        "truncate" => {
            let text = text(0);
            let limit = number(1).map(|n| n.max(0.0) as usize).unwrap_or(50);
            if text.chars().count() > limit {
                Value::String(format!("{}...", text.chars().take(limit).collect::<String>()))
            } else {
                Value::String(text)
            }
        }
        "default" => match arg(0) {
            Some(value) if is_truthy(&value) => value,
            _ => arg(1)?,
        },
        "join" => {
            let separator = arg(1)
                .map(|value| display(&value))
                .unwrap_or_else(|| ", ".to_string());
            match arg(0) {
                Some(Value::Array(items)) => Value::String(
                    items
                        .iter()
                        .map(display)
                        .collect::<Vec<_>>()
                        .join(&separator),
                ),
                other => Value::String(other.map(|value| display(&value)).unwrap_or_default()),
            }
        }
        "formatDate" => {
            let style = arg(1).map(|value| display(&value));
            Value::String(match arg(0).as_ref().and_then(as_datetime) {
                Some(at) => format_date(at, style.as_deref().unwrap_or("short")),
                None => "Invalid Date".to_string(),
            })
        }
        "if" => {
            if arg(0).is_some_and(|value| is_truthy(&value)) {
                arg(1).unwrap_or(Value::String(String::new()))
            } else {
                arg(2).unwrap_or(Value::String(String::new()))
            }
        }
        "eq" => Value::Bool(same(arg(0).as_ref(), arg(1).as_ref())),
        "neq" => Value::Bool(!same(arg(0).as_ref(), arg(1).as_ref())),
        "gt" => Value::Bool(number(0).unwrap_or(0.0) > number(1).unwrap_or(0.0)),
        "gte" => Value::Bool(number(0).unwrap_or(0.0) >= number(1).unwrap_or(0.0)),
        "lt" => Value::Bool(number(0).unwrap_or(0.0) < number(1).unwrap_or(0.0)),
        "lte" => Value::Bool(number(0).unwrap_or(0.0) <= number(1).unwrap_or(0.0)),
        "add" => number_value(number(0).unwrap_or(0.0) + number(1).unwrap_or(0.0)),
        "subtract" => number_value(number(0).unwrap_or(0.0) - number(1).unwrap_or(0.0)),
        "multiply" => number_value(number(0).unwrap_or(0.0) * number(1).unwrap_or(0.0)),
        "divide" => {
            let divisor = number(1).unwrap_or(0.0);
            if divisor == 0.0 {
                number_value(0.0)
            } else {
                number_value(number(0).unwrap_or(0.0) / divisor)
            }
        }
        _ => {
            tracing::debug!(helper = name, "unknown template helper");
            return None;
        }
    };

    Some(value)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn same(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a.and_then(as_number), b.and_then(as_number)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// RFC 3339 text or epoch milliseconds.
fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Number(number) => Utc.timestamp_millis_opt(number.as_i64()?).single(),
        _ => None,
    }
}

/// US English renderings in UTC; unknown styles fall back to RFC 3339.
fn format_date(at: DateTime<Utc>, style: &str) -> String {
    let pattern = match style {
        "short" => "%-m/%-d/%Y",
        "long" => "%A, %B %-d, %Y",
        "time" => "%-I:%M:%S %p",
        "datetime" => "%-m/%-d/%Y, %-I:%M:%S %p",
        _ => "%Y-%m-%dT%H:%M:%S%.3fZ",
    };
    at.format(pattern).to_string()
}

fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_currency(amount: f64) -> String {
    let formatted = format_number(amount.abs(), 2);
    if amount < 0.0 && formatted.chars().any(|c| c.is_ascii_digit() && c != '0') {
        format!("-${formatted}")
    } else {
        format!("${formatted}")
    }
}

fn format_number(value: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, value.abs());
    let (whole, fraction) = match fixed.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let negative = value < 0.0 && fixed.chars().any(|c| c.is_ascii_digit() && c != '0');
    let sign = if negative { "-" } else { "" };
    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Value {
        json!({
            "provider": "openai",
            "user": { "name": "Ada", "nickname": null },
            "context": { "currentCost": 1234.5, "threshold": 1000, "tags": ["a", "b"] }
        })
    }

    #[test]
    fn replaces_paths_and_keeps_unknown_placeholders() {
        let out = render("Hi {{ user.name }} on {{provider}}, {{missing.path}}", &vars());
        assert_eq!(out, "Hi Ada on openai, {{missing.path}}");
    }

    #[test]
    fn helpers_work_in_both_call_styles() {
        let vars = vars();
        assert_eq!(render("{{formatCurrency context.currentCost}}", &vars), "$1,234.50");
        assert_eq!(render("{{formatCurrency(context.currentCost)}}", &vars), "$1,234.50");
        assert_eq!(render("{{upper provider}}", &vars), "OPENAI");
        assert_eq!(render("{{ lower(\"LOUD\") }}", &vars), "loud");
        assert_eq!(render("{{formatNumber context.currentCost 1}}", &vars), "1,234.5");
        assert_eq!(render("{{join(context.tags, \" | \")}}", &vars), "a | b");
    }

    #[test]
    fn percent_treats_input_as_hundredths() {
        assert_eq!(render("{{formatPercent 80}}", &json!({})), "80.0%");
        let nested =
            "{{formatPercent (multiply (divide context.currentCost context.threshold) 100)}}";
        let vars = json!({ "context": { "currentCost": 150, "threshold": 200 } });
        assert_eq!(render(nested, &vars), "75.0%");
    }

    #[test]
    fn default_falls_back_for_missing_or_empty_values() {
        let vars = vars();
        assert_eq!(render("{{default user.nickname \"friend\"}}", &vars), "friend");
        assert_eq!(render("{{default(user.name, 'friend')}}", &vars), "Ada");
    }

    #[test]
    fn unknown_helpers_are_left_verbatim() {
        assert_eq!(render("{{shout provider}}", &vars()), "{{shout provider}}");
    }

    #[test]
    fn currency_and_number_formatting() {
        assert_eq!(format_currency(0.0), "$0.00");
        assert_eq!(format_currency(-5.0), "-$5.00");
        assert_eq!(format_currency(1_000_000.0), "$1,000,000.00");
        assert_eq!(format_number(999.6, 0), "1,000");
        assert_eq!(format_number(-0.001, 2), "0.00");
    }

    #[test]
    fn validate_reports_brace_mismatch_and_bad_expressions() {
        assert!(validate("Hello {{user.name}}").is_empty());

        let errors = validate("Hello {{user.name}");
        assert_eq!(errors, vec!["Mismatched braces: 1 opening, 0 closing"]);

        let errors = validate("{{user.name | upper}}");
        assert_eq!(errors, vec!["Invalid expression: user.name | upper"]);
    }

    #[test]
    fn format_date_styles() {
        let vars = json!({ "at": "2026-08-13T15:04:05Z", "epoch": 0 });
        assert_eq!(render("{{formatDate at}}", &vars), "8/13/2026");
        assert_eq!(render("{{formatDate at \"long\"}}", &vars), "Thursday, August 13, 2026");
        assert_eq!(render("{{formatDate(at, 'time')}}", &vars), "3:04:05 PM");
        assert_eq!(render("{{formatDate at 'datetime'}}", &vars), "8/13/2026, 3:04:05 PM");
        assert_eq!(render("{{formatDate at 'iso'}}", &vars), "2026-08-13T15:04:05.000Z");
        assert_eq!(render("{{formatDate epoch 'iso'}}", &vars), "1970-01-01T00:00:00.000Z");
        assert_eq!(render("{{formatDate \"yesterday\"}}", &vars), "Invalid Date");
    }

    #[test]
    fn if_blocks_pick_a_branch_and_nest() {
        let vars = vars();
        let template = "{{#if user.name}}Hi {{user.name}}{{else}}Hi there{{/if}}!";
        assert_eq!(render(template, &vars), "Hi Ada!");

        let template = "{{#if user.nickname}}aka {{user.nickname}}{{else}}no nickname{{/if}}";
        assert_eq!(render(template, &vars), "no nickname");

        let nested = "{{#if (gt context.currentCost context.threshold)}}over{{#if provider}} on {{provider}}{{/if}}{{/if}}";
        assert_eq!(render(nested, &vars), "over on openai");

        assert_eq!(render("{{#if missing}}shown{{/if}}done", &vars), "done");
    }

    #[test]
    fn unclosed_if_block_is_left_alone() {
        assert_eq!(
            render("{{#if provider}}open", &vars()),
            "{{#if provider}}open"
        );
    }

    #[test]
    fn inline_if_and_comparisons() {
        let vars = vars();
        assert_eq!(render("{{if (gte context.currentCost 1000) 'high' 'ok'}}", &vars), "high");
        assert_eq!(render("{{if user.nickname 'x'}}", &vars), "");
        assert_eq!(render("{{eq provider 'openai'}}", &vars), "true");
        assert_eq!(render("{{eq context.threshold '1000'}}", &vars), "true");
        assert_eq!(render("{{lt context.currentCost context.threshold}}", &vars), "false");
    }

    #[test]
    fn validate_understands_if_blocks() {
        assert!(validate("{{#if user.name}}Hi{{else}}Hey{{/if}}").is_empty());
        assert_eq!(
            validate("{{#if user.name}}Hi"),
            vec!["Unbalanced if blocks: 1 opening, 0 closing"]
        );
        assert_eq!(validate("{{#if}}x{{/if}}"), vec!["Invalid expression: #if"]);
    }

    #[test]
    fn branding_merges_with_caller_overrides() {
        let merged = with_branding(
            &json!({ "branding": { "footerText": "custom" } }),
            &json!({ "primaryColor": "#000", "footerText": "brand" }),
        );
        assert_eq!(merged["branding"]["primaryColor"], "#000");
        assert_eq!(merged["branding"]["footerText"], "custom");
    }

    #[test]
    fn preview_variables_render_sample_alert() {
        let vars = preview_variables("COST_ALERT");
        assert_eq!(
            render(
                "{{notification.type}}: {{formatCurrency context.currentCost}} for {{user.name}}",
                &vars
            ),
            "COST_ALERT: $150.75 for John Doe"
        );
    }
}
