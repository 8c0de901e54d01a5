//! Markdown to Feishu card element conversion.
//!
//! Cards render markdown natively except for tables and headings, so the
//! converter lifts markdown tables into table elements and headings into
//! bold div elements, leaving everything else as markdown blocks. Fenced
//! code is shielded from the heading pass so a `# comment` inside a block
//! is not mistaken for a heading.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)((?:^[ \t]*\|.+\|[ \t]*\n)(?:^[ \t]*\|[-:\s|]+\|[ \t]*\n)(?:^[ \t]*\|.+\|[ \t]*\n?)+)",
    )
    .unwrap()
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap());

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());

/// Split content into markdown / div / table elements for a card body.
pub fn build_card_elements(content: &str) -> Vec<Value> {
    let mut elements = Vec::new();
    let mut last_end = 0;

    for m in TABLE_RE.find_iter(content) {
        let before = &content[last_end..m.start()];
        if !before.trim().is_empty() {
            elements.extend(split_headings(before));
        }
        match parse_md_table(m.as_str()) {
            Some(table) => elements.push(table),
            None => elements.push(json!({"tag": "markdown", "content": m.as_str()})),
        }
        last_end = m.end();
    }

    let remaining = &content[last_end..];
    if !remaining.trim().is_empty() {
        elements.extend(split_headings(remaining));
    }

    if elements.is_empty() {
        elements.push(json!({"tag": "markdown", "content": content}));
    }
    elements
}

/// Convert headings to bold divs, protecting fenced code blocks.
fn split_headings(content: &str) -> Vec<Value> {
    // Replace code blocks with placeholders so the heading regex cannot
    // match inside them, then restore after splitting.
    let mut code_blocks = Vec::new();
    let mut protected = content.to_owned();
    for m in CODE_BLOCK_RE.find_iter(content) {
        let placeholder = format!("\u{0}CODE{}\u{0}", code_blocks.len());
        protected = protected.replacen(m.as_str(), &placeholder, 1);
        code_blocks.push(m.as_str().to_owned());
    }

    let mut elements = Vec::new();
    let mut last_end = 0;

    for caps in HEADING_RE.captures_iter(&protected) {
        let whole = caps.get(0).unwrap();
        let before = protected[last_end..whole.start()].trim();
        if !before.is_empty() {
            elements.push(json!({"tag": "markdown", "content": before}));
        }
        let text = caps.get(2).unwrap().as_str().trim();
        elements.push(json!({
            "tag": "div",
            "text": {"tag": "lark_md", "content": format!("**{text}**")},
        }));
        last_end = whole.end();
    }

    let remaining = protected[last_end..].trim();
    if !remaining.is_empty() {
        elements.push(json!({"tag": "markdown", "content": remaining}));
    }

    // Restore code blocks inside markdown elements.
    for (i, block) in code_blocks.iter().enumerate() {
        let placeholder = format!("\u{0}CODE{i}\u{0}");
        for element in &mut elements {
            if element.get("tag").and_then(|t| t.as_str()) == Some("markdown")
                && let Some(text) = element.get("content").and_then(|c| c.as_str())
                && text.contains(&placeholder)
            {
                let restored = text.replace(&placeholder, block);
                element["content"] = json!(restored);
            }
        }
    }

    if elements.is_empty() {
        elements.push(json!({"tag": "markdown", "content": content}));
    }
    elements
}

/// Parse a markdown table into a Feishu table element.
fn parse_md_table(table_text: &str) -> Option<Value> {
    let lines: Vec<&str> = table_text
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < 3 {
        return None;
    }

    let split_line = |line: &str| -> Vec<String> {
        line.trim_matches('|')
            .split('|')
            .map(|c| c.trim().to_owned())
            .collect()
    };

    let headers = split_line(lines[0]);
    let rows: Vec<Vec<String>> = lines[2..].iter().map(|l| split_line(l)).collect();

    let columns: Vec<Value> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            json!({
                "tag": "column",
                "name": format!("c{i}"),
                "display_name": h,
                "width": "auto",
            })
        })
        .collect();

    let row_values: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for i in 0..headers.len() {
                obj.insert(
                    format!("c{i}"),
                    json!(row.get(i).cloned().unwrap_or_default()),
                );
            }
            Value::Object(obj)
        })
        .collect();

    Some(json!({
        "tag": "table",
        "page_size": rows.len() + 1,
        "columns": columns,
        "rows": row_values,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_one_markdown_element() {
        let elements = build_card_elements("just some text");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["tag"], "markdown");
        assert_eq!(elements[0]["content"], "just some text");
    }

    #[test]
    fn headings_become_bold_divs() {
        let elements = build_card_elements("# Title\nbody text");
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["tag"], "div");
        assert_eq!(elements[0]["text"]["content"], "**Title**");
        assert_eq!(elements[1]["content"], "body text");
    }

    #[test]
    fn tables_become_table_elements() {
        let md = "| Name | Age |\n|------|-----|\n| Ada | 36 |\n| Alan | 41 |\n";
        let elements = build_card_elements(md);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["tag"], "table");
        assert_eq!(elements[0]["columns"][0]["display_name"], "Name");
        assert_eq!(elements[0]["rows"][0]["c0"], "Ada");
        assert_eq!(elements[0]["rows"][1]["c1"], "41");
    }

    #[test]
    fn text_around_table_is_preserved() {
        let md = "intro\n\n| A |\n|---|\n| 1 |\n\noutro";
        let elements = build_card_elements(md);
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0]["content"], "intro");
        assert_eq!(elements[1]["tag"], "table");
        assert_eq!(elements[2]["content"], "outro");
    }

    #[test]
    fn code_blocks_shield_hash_lines() {
        let md = "```\n# not a heading\ncode\n```\n# Real Heading";
        let elements = build_card_elements(md);

        let markdown: Vec<&str> = elements
            .iter()
            .filter(|e| e["tag"] == "markdown")
            .filter_map(|e| e["content"].as_str())
            .collect();
        assert!(markdown.iter().any(|c| c.contains("# not a heading")));

        let divs: Vec<&Value> = elements.iter().filter(|e| e["tag"] == "div").collect();
        assert_eq!(divs.len(), 1);
        assert_eq!(divs[0]["text"]["content"], "**Real Heading**");
    }

    #[test]
    fn ragged_table_rows_pad_with_empty() {
        let md = "| A | B |\n|---|---|\n| only |\n";
        let elements = build_card_elements(md);
        assert_eq!(elements[0]["rows"][0]["c1"], "");
    }
}
