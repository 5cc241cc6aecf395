use serde_json::{Map, Value};

/// Turn raw model text into a JSON object.
///
/// Models wrap output in markdown fences, lead with prose, leave trailing
/// commas, or stop before closing every brace. Each repair is applied in
/// turn until the text parses as an object.
pub fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    let cleaned = heuristic_repair(text);
    if cleaned.is_empty() {
        return Err("model returned no output".to_string());
    }

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", kind_of(&other))),
        Err(e) => Err(format!("output is not valid JSON: {}", e)),
    }
}

/// Strip fences, skip leading prose, drop trailing commas, balance braces.
pub fn heuristic_repair(text: &str) -> String {
    let unfenced = strip_code_fences(text);
    let body = match unfenced.find('{') {
        Some(start) => &unfenced[start..],
        None => unfenced.as_str(),
    };
    let body = trim_after_object(body);
    let body = strip_trailing_commas(body.trim());
    if body.starts_with('{') {
        balance_braces(&body)
    } else {
        body
    }
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[start + 3..];
    // Language tag, if any, runs to the end of the opening line.
    let content_start = after.find('\n').map_or(0, |p| p + 1);
    let after = &after[content_start..];
    match after.find("```") {
        Some(end) => after[..end].trim().to_string(),
        None => after.trim().to_string(),
    }
}

/// Cut anything after the object that closes at depth zero.
fn trim_after_object(text: &str) -> &str {
    let mut depth: i32 = 0;
    let mut scanner = StringScanner::default();
    for (i, ch) in text.char_indices() {
        if scanner.skip(ch) {
            continue;
        }
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return &text[..i + ch.len_utf8()];
                }
            }
            _ => {}
        }
    }
    text
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut scanner = StringScanner::default();
    let chars: Vec<char> = text.chars().collect();
    for (i, &ch) in chars.iter().enumerate() {
        if !scanner.skip(ch) && ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']') | None) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Append the closers a truncated object is missing, innermost first.
fn balance_braces(text: &str) -> String {
    let mut open = Vec::new();
    let mut scanner = StringScanner::default();
    for ch in text.chars() {
        if scanner.skip(ch) {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if scanner.in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}

/// Tracks whether the scan is inside a JSON string literal.
#[derive(Default)]
struct StringScanner {
    in_string: bool,
    escape_next: bool,
}

impl StringScanner {
    /// Feed one char; true when it belongs to a string literal (quotes included).
    fn skip(&mut self, ch: char) -> bool {
        if self.escape_next {
            self.escape_next = false;
            return true;
        }
        if self.in_string {
            match ch {
                '\\' => self.escape_next = true,
                '"' => self.in_string = false,
                _ => {}
            }
            return true;
        }
        if ch == '"' {
            self.in_string = true;
            return true;
        }
        false
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
