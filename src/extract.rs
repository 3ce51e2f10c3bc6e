//! Extraction of code and JSON from model responses
//!
//! Models chat. These helpers pull the usable payload out of the surrounding
//! prose: the first fenced code block for full-program rewrites, or an
//! embedded JSON object for structured responses. When nothing extractable is
//! present the caller gets `None`; we never guess at unstructured text.

/// Extract the first fenced code block from a response.
///
/// Prefers a ```python fence, then falls back to any fence. Returns the block
/// body with surrounding whitespace trimmed.
pub fn extract_code_block(text: &str) -> Option<String> {
    extract_fenced(text, "```python").or_else(|| extract_fenced(text, "```"))
}

fn extract_fenced(text: &str, opener: &str) -> Option<String> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    // Skip the remainder of the fence line (e.g. ```python3 or an info string).
    let body_start = rest.find('\n')? + 1;
    let body = &rest[body_start..];
    let end = body.find("```")?;
    let block = body[..end].trim();
    if block.is_empty() {
        None
    } else {
        Some(block.to_string())
    }
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON object embedded in surrounding text, handling markdown
/// fences and noise around the braces.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let clean = strip_markdown_fences(text);
    let start = clean.find('{')?;
    let end = clean.rfind('}')?;
    if start <= end {
        Some(&clean[start..=end])
    } else {
        None
    }
}

/// Fix common JSON defects in model output: trailing commas, smart quotes,
/// stray control characters.
pub fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
